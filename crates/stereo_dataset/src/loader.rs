//! Per-sample decode pipeline shared by the train and test loaders.

use crate::aug::{self, AugmentConfig};
use crate::codec::read_image;
use crate::filelist::{DataLayout, FileListEntry};
use crate::semantic::read_semantic;
use crate::types::{
    DatasetError, DatasetResult, ImageTensor, LabelMap, Mode, SemanticMask, StereoSample,
    TargetSize,
};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct SampleLoader {
    pub layout: DataLayout,
    pub target: TargetSize,
    pub sem_mask: SemanticMask,
    pub mode: Mode,
    /// Test runs read the right view only for stereo models.
    pub do_stereo: bool,
    pub augment: AugmentConfig,
}

impl SampleLoader {
    /// Decode the views of one entry without augmentation.
    pub fn decode(&self, entry: &FileListEntry) -> DatasetResult<StereoSample> {
        let paths = self.layout.resolve(entry);
        let dataset = self.layout.dataset;
        let (h, w) = (self.target.height as usize, self.target.width as usize);

        if self.mode == Mode::Test && !self.do_stereo {
            let left = read_image(&paths.left, self.target, dataset)?;
            return Ok(StereoSample {
                left,
                right: None,
                semantic: LabelMap::zeros(h, w),
                valid: ImageTensor::zeros(h, w, 1),
            });
        }

        let right_path = paths.right.as_deref().ok_or_else(|| {
            DatasetError::Config(format!(
                "entry '{}' has no right view but the loader needs stereo pairs",
                entry.left
            ))
        })?;
        let ((left, right), semantic) = rayon::join(
            || {
                rayon::join(
                    || read_image(&paths.left, self.target, dataset),
                    || read_image(right_path, self.target, dataset),
                )
            },
            || read_semantic(paths.semantic.as_deref(), self.target, dataset, self.sem_mask),
        );
        let (semantic, valid) = semantic?;
        Ok(StereoSample {
            left: left?,
            right: Some(right?),
            semantic,
            valid,
        })
    }

    /// Decode, then augment when in training mode.
    pub fn load<R: Rng + ?Sized>(
        &self,
        entry: &FileListEntry,
        rng: &mut R,
    ) -> DatasetResult<StereoSample> {
        let sample = self.decode(entry)?;
        Ok(match self.mode {
            Mode::Train => aug::augment(sample, &self.augment, rng),
            Mode::Test => sample,
        })
    }
}
