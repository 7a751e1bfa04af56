//! Image decoding, dataset-specific cropping, and resampling.

use crate::types::{DatasetError, DatasetResult, Dataset, ImageTensor, TargetSize};
use image::{DynamicImage, ImageFormat};
use std::fs;
use std::path::Path;

/// Decoder selected from the trailing characters of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormatHint {
    Jpeg,
    /// Fallback for every extension other than `jpg`.
    Png,
}

impl ImageFormatHint {
    /// Case-sensitive match on the last three characters: `jpg` selects JPEG,
    /// anything else (including `JPG` and `jpeg`) falls back to PNG.
    pub fn from_path(path: &Path) -> Self {
        if has_suffix(path, "jpg") {
            ImageFormatHint::Jpeg
        } else {
            ImageFormatHint::Png
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            ImageFormatHint::Jpeg => ImageFormat::Jpeg,
            ImageFormatHint::Png => ImageFormat::Png,
        }
    }
}

pub(crate) fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.to_str().is_some_and(|s| s.ends_with(suffix))
}

pub fn decode(bytes: &[u8], hint: ImageFormatHint) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory_with_format(bytes, hint.format())
}

pub(crate) fn read_bytes(path: &Path) -> DatasetResult<Vec<u8>> {
    fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Rows kept after removing the bottom fifth: `(h * 4) / 5`.
pub fn cropped_height(dataset: Dataset, height: usize) -> usize {
    match dataset {
        Dataset::Cityscapes => (height * 4) / 5,
        Dataset::Kitti => height,
    }
}

/// [`cropped_height`] for a decoded file; fails when the crop leaves no rows.
pub(crate) fn kept_rows(path: &Path, dataset: Dataset, height: usize) -> DatasetResult<usize> {
    match cropped_height(dataset, height) {
        0 => Err(DatasetError::Config(format!(
            "{}: {height} row(s) leave nothing after the {dataset} crop",
            path.display()
        ))),
        keep => Ok(keep),
    }
}

/// Decode an RGB image, apply the dataset crop, and area-resize to `target`.
pub fn read_image(path: &Path, target: TargetSize, dataset: Dataset) -> DatasetResult<ImageTensor> {
    let bytes = read_bytes(path)?;
    let hint = ImageFormatHint::from_path(path);
    let img = decode(&bytes, hint).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let (w, h) = (w as usize, h as usize);
    let keep = kept_rows(path, dataset, h)?;
    let data: Vec<f32> = rgb.as_raw()[..keep * w * 3]
        .iter()
        .map(|&v| v as f32 / 255.0)
        .collect();
    let src = ImageTensor::from_vec(keep, w, 3, data);
    Ok(resize_area(&src, target.height as usize, target.width as usize))
}

/// Per-output-index list of `(source index, overlap)` for area resampling.
fn area_spans(in_len: usize, out_len: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = in_len as f64 / out_len as f64;
    (0..out_len)
        .map(|o| {
            let start = o as f64 * scale;
            let end = (o + 1) as f64 * scale;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(in_len);
            (first..last)
                .filter_map(|i| {
                    let lo = start.max(i as f64);
                    let hi = end.min((i + 1) as f64);
                    (hi > lo).then(|| (i, (hi - lo) as f32))
                })
                .collect()
        })
        .collect()
}

/// Area-averaging resize: every output pixel is the mean of the source area it covers.
pub fn resize_area(src: &ImageTensor, out_h: usize, out_w: usize) -> ImageTensor {
    if src.height == out_h && src.width == out_w {
        return src.clone();
    }
    let c = src.channels;
    let ys = area_spans(src.height, out_h);
    let xs = area_spans(src.width, out_w);

    // Columns first, then rows.
    let mut tmp = vec![0.0f32; src.height * out_w * c];
    for y in 0..src.height {
        for (ox, span) in xs.iter().enumerate() {
            let norm: f32 = span.iter().map(|(_, w)| w).sum();
            for ch in 0..c {
                let acc: f32 = span.iter().map(|&(x, w)| src.at(y, x, ch) * w).sum();
                tmp[(y * out_w + ox) * c + ch] = acc / norm;
            }
        }
    }
    let mut out = vec![0.0f32; out_h * out_w * c];
    for (oy, span) in ys.iter().enumerate() {
        let norm: f32 = span.iter().map(|(_, w)| w).sum();
        for ox in 0..out_w {
            for ch in 0..c {
                let acc: f32 = span
                    .iter()
                    .map(|&(y, w)| tmp[(y * out_w + ox) * c + ch] * w)
                    .sum();
                out[(oy * out_w + ox) * c + ch] = acc / norm;
            }
        }
    }
    ImageTensor::from_vec(out_h, out_w, c, out)
}

/// Source index for nearest-neighbour sampling (no corner alignment, no half-pixel offset).
#[inline]
pub(crate) fn nearest_index(out_idx: usize, in_len: usize, out_len: usize) -> usize {
    let scale = in_len as f64 / out_len as f64;
    ((out_idx as f64 * scale).floor() as usize).min(in_len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extension_dispatch_is_case_sensitive() {
        assert_eq!(
            ImageFormatHint::from_path(&PathBuf::from("a/b/000000_10.jpg")),
            ImageFormatHint::Jpeg
        );
        assert_eq!(
            ImageFormatHint::from_path(&PathBuf::from("a/b/000000_10.JPG")),
            ImageFormatHint::Png
        );
        assert_eq!(
            ImageFormatHint::from_path(&PathBuf::from("frame.png")),
            ImageFormatHint::Png
        );
        assert_eq!(
            ImageFormatHint::from_path(&PathBuf::from("frame.bmp")),
            ImageFormatHint::Png
        );
    }

    #[test]
    fn cityscapes_crop_rounds_down() {
        assert_eq!(cropped_height(Dataset::Cityscapes, 1024), 819);
        assert_eq!(cropped_height(Dataset::Cityscapes, 7), 5);
        assert_eq!(cropped_height(Dataset::Kitti, 7), 7);
    }

    #[test]
    fn area_downsample_averages_blocks() {
        let src = ImageTensor::from_vec(2, 4, 1, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let out = resize_area(&src, 1, 2);
        assert!((out.at(0, 0, 0) - 2.5).abs() < 1e-6);
        assert!((out.at(0, 1, 0) - 4.5).abs() < 1e-6);
    }

    #[test]
    fn area_handles_fractional_coverage() {
        let src = ImageTensor::from_vec(1, 3, 1, vec![0.0, 3.0, 6.0]);
        let out = resize_area(&src, 1, 2);
        // [0, 1.5) -> (0*1 + 3*0.5) / 1.5, [1.5, 3) -> (3*0.5 + 6*1) / 1.5
        assert!((out.at(0, 0, 0) - 1.0).abs() < 1e-5);
        assert!((out.at(0, 1, 0) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn area_upsample_replicates() {
        let src = ImageTensor::from_vec(1, 2, 1, vec![0.25, 0.75]);
        let out = resize_area(&src, 2, 4);
        assert_eq!(out.data, vec![0.25, 0.25, 0.75, 0.75, 0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn nearest_index_floors() {
        assert_eq!(nearest_index(0, 10, 4), 0);
        assert_eq!(nearest_index(1, 10, 4), 2);
        assert_eq!(nearest_index(3, 10, 4), 7);
        assert_eq!(nearest_index(3, 2, 4), 1);
    }
}
