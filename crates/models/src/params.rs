//! Hyperparameters the model is constructed with.

use serde::{Deserialize, Serialize};
use stereo_dataset::named_enum;

named_enum!(
    /// Which heads are trained and evaluated.
    Task, "task", {
        Depth => "depth",
        Semantic => "semantic",
        SemanticDepth => "semantic-depth",
    }
);

impl Task {
    pub fn has_depth(&self) -> bool {
        matches!(self, Task::Depth | Task::SemanticDepth)
    }

    pub fn has_semantic(&self) -> bool {
        matches!(self, Task::Semantic | Task::SemanticDepth)
    }
}

named_enum!(
    Encoder, "encoder", {
        Vgg => "vgg",
        Resnet50 => "resnet50",
    }
);

named_enum!(
    /// Padding used when the image gradient runs off the frame.
    WrapMode, "wrap_mode", {
        /// Repeat the border pixel.
        Edge => "edge",
        /// Zero outside the frame.
        Border => "border",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub encoder: Encoder,
    pub height: usize,
    pub width: usize,
    pub batch_size: usize,
    pub num_threads: usize,
    pub num_epochs: usize,
    pub do_stereo: bool,
    pub wrap_mode: WrapMode,
    pub use_deconv: bool,
    pub alpha_image_loss: f32,
    pub disp_gradient_loss_weight: f32,
    pub lr_loss_weight: f32,
    pub task: Task,
    pub full_summary: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            encoder: Encoder::Vgg,
            height: 256,
            width: 512,
            batch_size: 8,
            num_threads: 8,
            num_epochs: 50,
            do_stereo: false,
            wrap_mode: WrapMode::Border,
            use_deconv: false,
            alpha_image_loss: 0.85,
            disp_gradient_loss_weight: 0.1,
            lr_loss_weight: 1.0,
            task: Task::Depth,
            full_summary: false,
        }
    }
}
