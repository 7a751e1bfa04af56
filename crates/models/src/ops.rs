//! Image-space tensor helpers for the photometric and smoothness losses (NHWC).

use crate::params::WrapMode;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Forward difference along x, padded back to full width.
///
/// `Edge` replicates the last column (zero gradient there); `Border` treats
/// the outside as zero.
pub fn gradient_x<B: Backend>(img: Tensor<B, 4>, wrap: WrapMode) -> Tensor<B, 4> {
    let [n, h, w, c] = img.dims();
    if w < 2 {
        return img.zeros_like();
    }
    let right = img.clone().slice([0..n, 0..h, 1..w, 0..c]);
    let left = img.clone().slice([0..n, 0..h, 0..w - 1, 0..c]);
    let pad = match wrap {
        WrapMode::Edge => Tensor::zeros([n, h, 1, c], &img.device()),
        WrapMode::Border => img.slice([0..n, 0..h, w - 1..w, 0..c]).neg(),
    };
    Tensor::cat(vec![right - left, pad], 2)
}

/// Forward difference along y, zero in the last row.
pub fn gradient_y<B: Backend>(img: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, h, w, c] = img.dims();
    if h < 2 {
        return img.zeros_like();
    }
    let below = img.clone().slice([0..n, 1..h, 0..w, 0..c]);
    let above = img.clone().slice([0..n, 0..h - 1, 0..w, 0..c]);
    let pad = Tensor::zeros([n, 1, w, c], &img.device());
    Tensor::cat(vec![below - above, pad], 1)
}

/// First-order horizontal resample: `img(x - shift)` with `shift` in pixels
/// (N×H×W×1, broadcast over channels).
pub fn shift_x<B: Backend>(img: Tensor<B, 4>, shift: Tensor<B, 4>, wrap: WrapMode) -> Tensor<B, 4> {
    let grad = gradient_x(img.clone(), wrap);
    img - grad * shift
}

/// `(1 - alpha) * L1 + alpha * L1` of the x/y gradients.
pub fn image_loss<B: Backend>(
    est: Tensor<B, 4>,
    target: Tensor<B, 4>,
    alpha: f32,
    wrap: WrapMode,
) -> Tensor<B, 1> {
    let l1 = (est.clone() - target.clone()).abs().mean();
    let gx = (gradient_x(est.clone(), wrap) - gradient_x(target.clone(), wrap))
        .abs()
        .mean();
    let gy = (gradient_y(est) - gradient_y(target)).abs().mean();
    l1.mul_scalar(1.0 - alpha) + (gx + gy).mul_scalar(alpha * 0.5)
}

/// Edge-aware smoothness of a disparity map (N×H×W×1) against its image.
pub fn smoothness<B: Backend>(disp: Tensor<B, 4>, img: Tensor<B, 4>, wrap: WrapMode) -> Tensor<B, 1> {
    let [_, _, _, c] = img.dims();
    let weight_x = gradient_x(img.clone(), wrap)
        .abs()
        .sum_dim(3)
        .div_scalar(c as f32)
        .neg()
        .exp();
    let weight_y = gradient_y(img).abs().sum_dim(3).div_scalar(c as f32).neg().exp();
    let sx = (gradient_x(disp.clone(), WrapMode::Edge).abs() * weight_x).mean();
    let sy = (gradient_y(disp).abs() * weight_y).mean();
    sx + sy
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type B = burn_ndarray::NdArray<f32>;

    fn row(values: Vec<f32>) -> Tensor<B, 4> {
        let w = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, w, 1]), &Default::default())
    }

    fn host(t: Tensor<B, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn gradient_x_padding_follows_wrap_mode() {
        let img = row(vec![1.0, 3.0, 6.0]);
        assert_eq!(host(gradient_x(img.clone(), WrapMode::Edge)), vec![2.0, 3.0, 0.0]);
        assert_eq!(host(gradient_x(img, WrapMode::Border)), vec![2.0, 3.0, -6.0]);
    }

    #[test]
    fn zero_shift_is_identity() {
        let img = row(vec![0.2, 0.4, 0.9]);
        let shift = row(vec![0.0, 0.0, 0.0]);
        assert_eq!(host(shift_x(img.clone(), shift, WrapMode::Edge)), host(img));
    }

    #[test]
    fn identical_images_have_zero_loss() {
        let img = row(vec![0.1, 0.5, 0.3, 0.7]);
        let loss = image_loss(img.clone(), img, 0.85, WrapMode::Border);
        assert_eq!(loss.into_scalar(), 0.0);
    }
}
