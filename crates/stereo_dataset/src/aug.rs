//! Synchronized stereo-pair augmentation.

use crate::types::{ImageTensor, StereoSample};
use rand::Rng;

pub const GAMMA_RANGE: (f32, f32) = (0.8, 1.2);
pub const BRIGHTNESS_RANGE: (f32, f32) = (0.5, 2.0);
pub const COLOR_RANGE: (f32, f32) = (0.8, 1.2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentConfig {
    /// Allow the random left/right swap-and-mirror.
    pub flip: bool,
    /// Allow the gamma/brightness/colour shift.
    pub photometric: bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            flip: true,
            photometric: true,
        }
    }
}

/// Factors shared by both views of a pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhotometricShift {
    pub gamma: f32,
    pub brightness: f32,
    pub colors: [f32; 3],
}

impl PhotometricShift {
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let gamma = rng.random_range(GAMMA_RANGE.0..GAMMA_RANGE.1);
        let brightness = rng.random_range(BRIGHTNESS_RANGE.0..BRIGHTNESS_RANGE.1);
        let colors = [
            rng.random_range(COLOR_RANGE.0..COLOR_RANGE.1),
            rng.random_range(COLOR_RANGE.0..COLOR_RANGE.1),
            rng.random_range(COLOR_RANGE.0..COLOR_RANGE.1),
        ];
        Self {
            gamma,
            brightness,
            colors,
        }
    }

    /// Gamma, then brightness, then per-channel colour, then clip to [0, 1].
    pub fn apply(&self, img: &mut ImageTensor) {
        let channels = img.channels;
        for (i, v) in img.data.iter_mut().enumerate() {
            let color = self.colors[i % channels];
            *v = (v.powf(self.gamma) * self.brightness * color).clamp(0.0, 1.0);
        }
    }
}

/// Outcome of the two per-sample Bernoulli draws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentDraws {
    pub flip: bool,
    pub photometric: Option<PhotometricShift>,
}

impl AugmentDraws {
    pub const IDENTITY: AugmentDraws = AugmentDraws {
        flip: false,
        photometric: None,
    };

    /// Two independent draws, each true when `u > 0.5` for `u` uniform in [0, 1).
    pub fn sample<R: Rng + ?Sized>(cfg: &AugmentConfig, rng: &mut R) -> Self {
        let flip = rng.random::<f32>() > 0.5;
        let augment = rng.random::<f32>() > 0.5;
        let photometric = augment.then(|| PhotometricShift::sample(rng));
        Self {
            flip: flip && cfg.flip,
            photometric: photometric.filter(|_| cfg.photometric),
        }
    }
}

/// Apply `draws` to a training sample: flip first, photometric shift second.
///
/// A flip swaps the views and mirrors both. The validity mask is cleared
/// because the ground truth only describes the canonical left view; the
/// label map is passed through unflipped.
pub fn apply(sample: StereoSample, draws: &AugmentDraws) -> StereoSample {
    let StereoSample {
        left,
        right,
        semantic,
        valid,
    } = sample;

    let (mut left, mut right, valid) = match (draws.flip, right) {
        (true, Some(right)) => {
            let zeros = ImageTensor::zeros(valid.height, valid.width, valid.channels);
            (right.mirrored(), Some(left.mirrored()), zeros)
        }
        (_, right) => (left, right, valid),
    };

    if let Some(shift) = &draws.photometric {
        shift.apply(&mut left);
        if let Some(right) = right.as_mut() {
            shift.apply(right);
        }
    }

    StereoSample {
        left,
        right,
        semantic,
        valid,
    }
}

/// Draw and apply in one go.
pub fn augment<R: Rng + ?Sized>(sample: StereoSample, cfg: &AugmentConfig, rng: &mut R) -> StereoSample {
    let draws = AugmentDraws::sample(cfg, rng);
    apply(sample, &draws)
}
