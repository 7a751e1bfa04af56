//! Command-line configuration and its startup validation.

use crate::surgery::CascadePolicy;
use clap::Parser;
use models::{Encoder, ModelParams, Task, WrapMode};
use serde::Serialize;
use std::path::PathBuf;
use stereo_dataset::{AugmentConfig, Dataset, Mode, SemanticMask, TargetSize, DEFAULT_MIN_AFTER_DEQUEUE};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    Zero(&'static str),
    #[error("batch size {batch_size} is not divisible by num_gpus {num_gpus}")]
    UnevenShards { batch_size: usize, num_gpus: usize },
    #[error("test mode only supports the kitti dataset (got {0})")]
    TestDataset(Dataset),
    #[error("--retrain needs --checkpoint-path")]
    RetrainWithoutCheckpoint,
}

#[derive(Parser, Debug, Clone, Serialize)]
#[command(
    name = "semdepth",
    about = "Train or test the semantic-depth stereo network"
)]
pub struct RunArgs {
    /// Category filter for the semantic ground truth.
    #[arg(long)]
    pub sem_mask: SemanticMask,
    #[arg(long, default_value_t = Mode::Train)]
    pub mode: Mode,
    #[arg(long, default_value_t = Task::SemanticDepth)]
    pub task: Task,
    /// Run name; checkpoints and summaries go to <log-directory>/<model-name>.
    #[arg(long)]
    pub model_name: String,
    #[arg(long, default_value_t = Encoder::Resnet50)]
    pub encoder: Encoder,
    #[arg(long, default_value_t = Dataset::Cityscapes)]
    pub dataset: Dataset,
    /// Dataset root the file list is relative to.
    #[arg(long)]
    pub data_path: PathBuf,
    /// Whitespace-separated file list, one sample per line.
    #[arg(long)]
    pub filenames_file: PathBuf,
    #[arg(long, default_value_t = 256)]
    pub input_height: u32,
    #[arg(long, default_value_t = 512)]
    pub input_width: u32,
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 50)]
    pub num_epochs: usize,
    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,
    /// Left-right consistency weight.
    #[arg(long, default_value_t = 1.0)]
    pub lr_loss_weight: f32,
    /// Weight between the structural and L1 terms of the image loss.
    #[arg(long, default_value_t = 0.85)]
    pub alpha_image_loss: f32,
    /// Disparity smoothness weight.
    #[arg(long, default_value_t = 0.1)]
    pub disp_gradient_loss_weight: f32,
    /// Feed both views to the network.
    #[arg(long)]
    pub do_stereo: bool,
    #[arg(long, default_value_t = WrapMode::Border)]
    pub wrap_mode: WrapMode,
    #[arg(long)]
    pub use_deconv: bool,
    /// Towers per step; each gets batch_size / num_gpus samples.
    #[arg(long, default_value_t = 1)]
    pub num_gpus: usize,
    /// Data loading workers.
    #[arg(long, default_value_t = 8)]
    pub num_threads: usize,
    /// Test output directory; defaults to the restored checkpoint's directory.
    #[arg(long)]
    pub output_directory: Option<PathBuf>,
    #[arg(long, default_value = "./logs/")]
    pub log_directory: PathBuf,
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,
    /// Restart the step counter at zero after restoring.
    #[arg(long)]
    pub retrain: bool,
    /// Record per-variable weight norms in the summaries as well.
    #[arg(long)]
    pub full_summary: bool,
    /// Strict file order instead of shuffle-buffer draws.
    #[arg(long)]
    pub no_shuffle: bool,
    /// Which variables keep training after a restore.
    #[arg(long, default_value_t = CascadePolicy::FineTuneAll)]
    pub cascade_policy: CascadePolicy,
    #[arg(long, default_value_t = DEFAULT_MIN_AFTER_DEQUEUE)]
    pub min_after_dequeue: usize,
    /// Seeds weight init, augmentation, and shuffle draws.
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub no_flip: bool,
    /// Disable the gamma/brightness/colour shift.
    #[arg(long)]
    pub no_augment: bool,
}

impl RunArgs {
    /// Cross-field checks; runs before any file is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("batch_size", self.batch_size),
            ("num_epochs", self.num_epochs),
            ("num_gpus", self.num_gpus),
            ("num_threads", self.num_threads),
            ("input_height", self.input_height as usize),
            ("input_width", self.input_width as usize),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.batch_size % self.num_gpus != 0 {
            return Err(ConfigError::UnevenShards {
                batch_size: self.batch_size,
                num_gpus: self.num_gpus,
            });
        }
        if self.mode == Mode::Test && self.dataset != Dataset::Kitti {
            return Err(ConfigError::TestDataset(self.dataset));
        }
        if self.retrain && self.checkpoint_path.is_none() {
            return Err(ConfigError::RetrainWithoutCheckpoint);
        }
        Ok(())
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            encoder: self.encoder,
            height: self.input_height as usize,
            width: self.input_width as usize,
            batch_size: self.batch_size,
            num_threads: self.num_threads,
            num_epochs: self.num_epochs,
            do_stereo: self.do_stereo,
            wrap_mode: self.wrap_mode,
            use_deconv: self.use_deconv,
            alpha_image_loss: self.alpha_image_loss,
            disp_gradient_loss_weight: self.disp_gradient_loss_weight,
            lr_loss_weight: self.lr_loss_weight,
            task: self.task,
            full_summary: self.full_summary,
        }
    }

    pub fn target(&self) -> TargetSize {
        TargetSize::new(self.input_height, self.input_width)
    }

    pub fn augment(&self) -> AugmentConfig {
        AugmentConfig {
            flip: !self.no_flip,
            photometric: !self.no_augment,
        }
    }

    /// `<log_directory>/<model_name>`.
    pub fn run_dir(&self) -> PathBuf {
        self.log_directory.join(&self.model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> RunArgs {
        parse_with_mask("none", extra)
    }

    fn parse_with_mask(sem_mask: &str, extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "semdepth",
            "--sem-mask",
            sem_mask,
            "--model-name",
            "run",
            "--data-path",
            "/data",
            "--filenames-file",
            "files.txt",
        ];
        argv.extend_from_slice(extra);
        RunArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_the_reference_run() {
        let args = parse(&[]);
        assert_eq!(args.mode, Mode::Train);
        assert_eq!(args.task, Task::SemanticDepth);
        assert_eq!(args.encoder, Encoder::Resnet50);
        assert_eq!(args.dataset, Dataset::Cityscapes);
        assert_eq!(args.wrap_mode, WrapMode::Border);
        assert_eq!((args.input_height, args.input_width, args.batch_size), (256, 512, 2));
        assert_eq!(args.min_after_dequeue, 2048);
        assert_eq!(args.run_dir(), PathBuf::from("./logs/run"));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn enum_values_use_lowercase_names() {
        let args = parse_with_mask("only_vehicle", &["--task", "depth", "--wrap-mode", "edge"]);
        assert_eq!(args.sem_mask, SemanticMask::OnlyVehicle);
        assert_eq!(args.task, Task::Depth);
        assert_eq!(args.wrap_mode, WrapMode::Edge);

        let argv = ["semdepth", "--sem-mask", "cars", "--model-name", "r", "--data-path", "d", "--filenames-file", "f"];
        assert!(RunArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn cross_field_checks() {
        assert_eq!(
            parse(&["--batch-size", "6", "--num-gpus", "4"]).validate(),
            Err(ConfigError::UnevenShards {
                batch_size: 6,
                num_gpus: 4
            })
        );
        assert_eq!(
            parse(&["--mode", "test"]).validate(),
            Err(ConfigError::TestDataset(Dataset::Cityscapes))
        );
        assert!(parse(&["--mode", "test", "--dataset", "kitti"]).validate().is_ok());
        assert_eq!(
            parse(&["--retrain"]).validate(),
            Err(ConfigError::RetrainWithoutCheckpoint)
        );
        assert_eq!(
            parse(&["--num-threads", "0"]).validate(),
            Err(ConfigError::Zero("num_threads"))
        );
    }
}
