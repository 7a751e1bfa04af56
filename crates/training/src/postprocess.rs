//! Test-time fusion of a disparity map with the one predicted on the mirrored input.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("disparity {view} has {found} values, expected {height}x{width}")]
pub struct DisparityShapeError {
    pub view: &'static str,
    pub found: usize,
    pub height: usize,
    pub width: usize,
}

/// `linspace(0, 1, w)`.
fn linspace(w: usize) -> Vec<f32> {
    if w < 2 {
        return vec![0.0; w];
    }
    (0..w).map(|x| x as f32 / (w - 1) as f32).collect()
}

fn mirror_rows(data: &[f32], w: usize) -> Vec<f32> {
    data.chunks(w.max(1))
        .flat_map(|row| row.iter().rev().copied())
        .collect()
}

/// Blend `d0` (prediction on the original image) with `mirror(d1)` (prediction
/// on the mirrored image, mirrored back). Each keeps the side of the frame
/// where it has no occlusion artifacts; the centre uses their mean.
pub fn post_process_disparity(
    d0: &[f32],
    d1: &[f32],
    h: usize,
    w: usize,
) -> Result<Vec<f32>, DisparityShapeError> {
    for (view, d) in [("d0", d0), ("d1", d1)] {
        if d.len() != h * w {
            return Err(DisparityShapeError {
                view,
                found: d.len(),
                height: h,
                width: w,
            });
        }
    }
    let l_mask_row: Vec<f32> = linspace(w)
        .into_iter()
        .map(|l| 1.0 - (20.0 * (l - 0.05)).clamp(0.0, 1.0))
        .collect();
    let r_mask_row: Vec<f32> = l_mask_row.iter().rev().copied().collect();
    let r_disp = mirror_rows(d1, w);

    let mut out = Vec::with_capacity(h * w);
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let (l_mask, r_mask) = (l_mask_row[x], r_mask_row[x]);
            let mean = 0.5 * (d0[i] + r_disp[i]);
            out.push(r_mask * d0[i] + l_mask * r_disp[i] + (1.0 - l_mask - r_mask) * mean);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_input_is_returned_unchanged() {
        let (h, w) = (3, 40);
        let d0: Vec<f32> = (0..h * w).map(|i| ((i * 7) % 13) as f32 * 0.01).collect();
        let d1 = mirror_rows(&d0, w);
        let out = post_process_disparity(&d0, &d1, h, w).unwrap();
        for (a, b) in out.iter().zip(&d0) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn borders_take_the_unoccluded_prediction() {
        let (h, w) = (1, 41);
        let d0 = vec![1.0; w];
        let d1 = vec![3.0; w];
        let out = post_process_disparity(&d0, &d1, h, w).unwrap();
        // Left edge: l_mask = 1, r_mask = 0, so the mirrored prediction wins.
        assert!((out[0] - 3.0).abs() < 1e-6);
        assert!((out[w - 1] - 1.0).abs() < 1e-6);
        // Centre: both masks are zero, so the mean.
        assert!((out[w / 2] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = post_process_disparity(&[0.0; 6], &[0.0; 5], 2, 3).unwrap_err();
        assert_eq!(err.view, "d1");
        assert_eq!(err.found, 5);
        assert!(post_process_disparity(&[0.0; 4], &[0.0; 6], 2, 3).is_err());
    }
}
