//! Semantic ground-truth decoding and validity masks.

use crate::codec::{self, has_suffix, kept_rows, nearest_index, ImageFormatHint};
use crate::types::{
    DatasetError, DatasetResult, Dataset, ImageTensor, LabelMap, SemanticMask, TargetSize,
};
use image::DynamicImage;
use std::path::Path;

/// Cityscapes "flat" category ids: road, sidewalk, parking, rail track.
pub const FLAT_CATEGORIES: [i32; 4] = [7, 8, 9, 10];
/// First Cityscapes vehicle category id (car); everything above it is a vehicle too.
pub const FIRST_VEHICLE_CATEGORY: i32 = 26;

impl SemanticMask {
    pub fn accepts(&self, id: i32) -> bool {
        match self {
            SemanticMask::None => true,
            SemanticMask::NoFlat => !FLAT_CATEGORIES.contains(&id),
            SemanticMask::OnlyFlat => FLAT_CATEGORIES.contains(&id),
            SemanticMask::NoVehicle => id < FIRST_VEHICLE_CATEGORY,
            SemanticMask::OnlyVehicle => id >= FIRST_VEHICLE_CATEGORY,
        }
    }
}

/// Validity mask for `labels` under `policy`.
pub fn validity_mask(labels: &LabelMap, policy: SemanticMask) -> ImageTensor {
    let data = labels
        .ids
        .iter()
        .map(|&id| if policy.accepts(id) { 1.0 } else { 0.0 })
        .collect();
    ImageTensor::from_vec(labels.height, labels.width, 1, data)
}

/// Read the semantic label map for a sample.
///
/// Only `png` paths are decoded. Any other path, or no path at all, stands
/// for "no ground truth": labels and validity are both zero whatever the
/// policy says.
pub fn read_semantic(
    path: Option<&Path>,
    target: TargetSize,
    dataset: Dataset,
    policy: SemanticMask,
) -> DatasetResult<(LabelMap, ImageTensor)> {
    let (h, w) = (target.height as usize, target.width as usize);
    let Some(path) = path.filter(|p| has_suffix(p, "png")) else {
        return Ok((LabelMap::zeros(h, w), ImageTensor::zeros(h, w, 1)));
    };

    let bytes = codec::read_bytes(path)?;
    let img = codec::decode(&bytes, ImageFormatHint::Png).map_err(|source| {
        DatasetError::Image {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let (src_w, src_h, raw) = first_channel(&img);
    let keep = kept_rows(path, dataset, src_h)?;

    let mut ids = Vec::with_capacity(h * w);
    for y in 0..h {
        let sy = nearest_index(y, keep, h);
        for x in 0..w {
            let sx = nearest_index(x, src_w, w);
            ids.push(raw[sy * src_w + sx]);
        }
    }
    let labels = LabelMap {
        height: h,
        width: w,
        ids,
    };
    let valid = validity_mask(&labels, policy);
    Ok((labels, valid))
}

/// Category ids from the first channel of a label image.
fn first_channel(img: &DynamicImage) -> (usize, usize, Vec<i32>) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let raw = match img {
        DynamicImage::ImageLuma8(buf) => buf.as_raw().iter().map(|&v| v as i32).collect(),
        DynamicImage::ImageLuma16(buf) => buf.as_raw().iter().map(|&v| v as i32).collect(),
        DynamicImage::ImageLumaA8(buf) => buf.as_raw().iter().step_by(2).map(|&v| v as i32).collect(),
        other => other
            .to_rgb8()
            .as_raw()
            .iter()
            .step_by(3)
            .map(|&v| v as i32)
            .collect(),
    };
    (w, h, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary_grid() -> LabelMap {
        LabelMap {
            height: 2,
            width: 3,
            ids: vec![6, 7, 10, 11, 25, 26],
        }
    }

    #[test]
    fn no_flat_zeroes_only_flat_ids() {
        let valid = validity_mask(&boundary_grid(), SemanticMask::NoFlat);
        assert_eq!(valid.data, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn only_flat_keeps_only_flat_ids() {
        let valid = validity_mask(&boundary_grid(), SemanticMask::OnlyFlat);
        assert_eq!(valid.data, vec![0.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn vehicle_threshold_is_26() {
        let no = validity_mask(&boundary_grid(), SemanticMask::NoVehicle);
        assert_eq!(no.data, vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
        let only = validity_mask(&boundary_grid(), SemanticMask::OnlyVehicle);
        assert_eq!(only.data, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn none_policy_accepts_everything() {
        let valid = validity_mask(&boundary_grid(), SemanticMask::None);
        assert!(valid.data.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn non_png_path_is_missing_ground_truth() {
        let target = TargetSize::new(4, 6);
        for policy in [
            SemanticMask::None,
            SemanticMask::NoFlat,
            SemanticMask::OnlyFlat,
            SemanticMask::NoVehicle,
            SemanticMask::OnlyVehicle,
        ] {
            let (labels, valid) = read_semantic(
                Some(Path::new("does/not/exist.jpg")),
                target,
                Dataset::Kitti,
                policy,
            )
            .expect("fallback never touches the filesystem");
            assert_eq!(labels, LabelMap::zeros(4, 6));
            assert!(valid.is_all_zero());
            assert_eq!(valid.data.len(), 24);
        }
        let (_, valid) = read_semantic(None, target, Dataset::Kitti, SemanticMask::None).unwrap();
        assert!(valid.is_all_zero());
    }

    #[test]
    fn missing_png_is_an_io_error() {
        let err = read_semantic(
            Some(Path::new("does/not/exist.png")),
            TargetSize::new(2, 2),
            Dataset::Kitti,
            SemanticMask::None,
        )
        .unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }
}
