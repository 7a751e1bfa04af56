#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod evaluate;
pub mod gradients;
pub mod optimizer;
pub mod postprocess;
pub mod schedule;
pub mod summary;
pub mod surgery;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use config::{ConfigError, RunArgs};
pub use evaluate::{run_test, TestReport};
pub use gradients::{average_gradients, ensure_complete, GradientError, GradientSet};
pub use postprocess::{post_process_disparity, DisparityShapeError};
pub use schedule::PiecewiseConstant;
pub use surgery::{plan_restore, CascadePolicy, RestorePlan};
pub use trainer::{run_train, TrainReport};

use stereo_dataset::Mode;

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = burn::backend::Autodiff<TrainBackend>;

/// Dispatch on `--mode`.
pub fn run(args: RunArgs) -> anyhow::Result<()> {
    match args.mode {
        Mode::Train => run_train(&args).map(|_| ()),
        Mode::Test => run_test(&args).map(|_| ()),
    }
}
