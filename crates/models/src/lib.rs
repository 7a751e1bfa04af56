//! Stereo depth / semantic models for the semdepth training stack.
//!
//! This crate defines the contract the training and test loops drive:
//! - `StereoModel`: trainable inventory plus a forward pass over an explicit `WeightSet`.
//! - `VariableId`: structured component path used for checkpoint matching.
//! - `PointwiseStereoModel`: small per-pixel reference network with the full loss wiring.
//!
//! Weights are never owned by a model. Every tower of a step receives the same
//! `WeightSet` snapshot, so there is no variable-reuse flag to thread through.

pub mod ops;
pub mod params;
pub mod pointwise;
pub mod variable;
pub mod weights;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use stereo_dataset::{BurnStereoBatch, Mode};
use thiserror::Error;

pub use params::{Encoder, ModelParams, Task, WrapMode};
pub use pointwise::{PointwiseStereoModel, NUM_CLASSES};
pub use variable::{Init, InvalidVariableId, VariableId, VariableSpec, VariableValues};
pub use weights::WeightSet;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("variable {0} is not in the weight set")]
    MissingVariable(VariableId),
    #[error("variable {id} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        id: VariableId,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("{0} input is required for this mode and task")]
    MissingInput(&'static str),
    #[error("tensor readback failed: {0}")]
    Tensor(String),
}

/// One tower's shard, NHWC.
#[derive(Debug, Clone)]
pub struct ModelInputs<B: Backend> {
    pub left: Tensor<B, 4>,
    pub right: Option<Tensor<B, 4>>,
    /// Category ids as floats, N×H×W×1.
    pub semantic: Option<Tensor<B, 4>>,
    pub valid: Option<Tensor<B, 4>>,
}

impl<B: Backend> From<BurnStereoBatch<B>> for ModelInputs<B> {
    fn from(batch: BurnStereoBatch<B>) -> Self {
        Self {
            left: batch.left,
            right: batch.right,
            semantic: Some(batch.semantic),
            valid: Some(batch.valid),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelOutputs<B: Backend> {
    /// Scalar loss; training mode only.
    pub total_loss: Option<Tensor<B, 1>>,
    /// Left disparity at full resolution, N×H×W.
    pub disp_left_est: Option<Tensor<B, 3>>,
    /// Semantic logits, N×H×W×C.
    pub sem_est: Option<Tensor<B, 4>>,
}

/// A network the training loop can drive.
pub trait StereoModel: Send + Sync {
    /// Trainable inventory in a fixed order; towers report gradients in this order.
    fn variables(&self) -> &[VariableSpec];

    fn mode(&self) -> Mode;

    fn task(&self) -> Task;

    fn forward<B: Backend>(
        &self,
        weights: &WeightSet<B>,
        inputs: &ModelInputs<B>,
        tower: usize,
    ) -> Result<ModelOutputs<B>, ModelError>;

    fn variable_ids(&self) -> Vec<VariableId> {
        self.variables().iter().map(|v| v.id.clone()).collect()
    }

    /// Number of trainable scalars.
    fn parameter_count(&self) -> usize {
        self.variables().iter().map(VariableSpec::numel).sum()
    }
}

pub mod prelude {
    pub use super::{
        ModelError, ModelInputs, ModelOutputs, ModelParams, PointwiseStereoModel, StereoModel,
        Task, VariableId, VariableSpec, WeightSet,
    };
}
