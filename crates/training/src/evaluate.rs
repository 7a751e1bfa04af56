//! Test pass: per-sample inference, disparity post-processing, `.npy` outputs.

use crate::checkpoint::{self, CheckpointError};
use crate::config::RunArgs;
use crate::postprocess::post_process_disparity;
use crate::trainer::restore_weights;
use crate::TrainBackend;
use anyhow::{anyhow, bail, Context};
use burn::tensor::backend::Backend;
use models::{ModelInputs, PointwiseStereoModel, StereoModel};
use ndarray::Array3;
use ndarray_npy::write_npy;
use std::fs;
use std::path::PathBuf;
use stereo_dataset::{read_file_list, DataLayout, Mode, SampleLoader, TestLoader};
use tracing::{debug, info, warn};

pub const DISPARITIES_FILE: &str = "disparities.npy";
pub const DISPARITIES_PP_FILE: &str = "disparities_pp.npy";
pub const SEMANTICS_FILE: &str = "semantics.npy";

#[derive(Debug, Clone)]
pub struct TestReport {
    pub num_samples: usize,
    pub checkpoint: PathBuf,
    pub written: Vec<PathBuf>,
}

/// Index of the largest logit per pixel; ties go to the lowest class.
pub fn argmax_classes(logits: &[f32], classes: usize) -> Vec<f32> {
    logits
        .chunks(classes)
        .map(|px| {
            let mut best = 0;
            for (c, v) in px.iter().enumerate() {
                if *v > px[best] {
                    best = c;
                }
            }
            best as f32
        })
        .collect()
}

fn host(t: burn::tensor::Tensor<TrainBackend, 3>) -> anyhow::Result<Vec<f32>> {
    t.into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("tensor readback failed: {e:?}"))
}

pub fn run_test(args: &RunArgs) -> anyhow::Result<TestReport> {
    args.validate()?;
    let min_fields = if args.do_stereo { 2 } else { 1 };
    let entries = read_file_list(&args.filenames_file, min_fields)?;
    let num_samples = entries.len();

    let run_dir = args.run_dir();
    let restore_path = match &args.checkpoint_path {
        Some(path) => path.clone(),
        None => checkpoint::latest(&run_dir)?.ok_or(CheckpointError::NotFound(run_dir.clone()))?,
    };

    let device = <TrainBackend as Backend>::Device::default();
    let model = PointwiseStereoModel::new(args.model_params(), Mode::Test, args.task);
    let restored = restore_weights(&model, args, Some(&restore_path), &device)?;
    if restored.plan.restore.len() < model.variables().len() {
        warn!(
            restored = restored.plan.restore.len(),
            total = model.variables().len(),
            "checkpoint does not cover every variable; the rest keep their fresh initialization"
        );
    }
    let weights = restored.weights;

    let loader = SampleLoader {
        layout: DataLayout::new(&args.data_path, args.dataset),
        target: args.target(),
        sem_mask: args.sem_mask,
        mode: Mode::Test,
        do_stereo: args.do_stereo,
        augment: args.augment(),
    };
    let mut test_loader = TestLoader::new(entries, loader);

    let (h, w) = (args.input_height as usize, args.input_width as usize);
    let plane = h * w;
    let task = args.task;
    let mut disparities = vec![0.0f32; num_samples * plane];
    let mut disparities_pp = vec![0.0f32; num_samples * plane];
    let mut semantics = vec![0.0f32; num_samples * plane];

    info!("now testing {} files", num_samples);
    for step in 0..num_samples {
        debug!(step, "test step");
        let batch = test_loader
            .next_batch()?
            .ok_or_else(|| anyhow!("test loader ran out at sample {step}"))?;
        let inputs = ModelInputs::from(batch.to_tensors::<TrainBackend>(&device));
        let outputs = model.forward(&weights, &inputs, 0)?;
        let out = step * plane..(step + 1) * plane;

        if task.has_depth() {
            let disp = outputs
                .disp_left_est
                .ok_or_else(|| anyhow!("model produced no disparity"))?;
            let disp = host(disp)?;
            if disp.len() != 2 * plane {
                bail!("disparity output has {} values, expected 2x{h}x{w}", disp.len());
            }
            let (d0, d1) = disp.split_at(plane);
            disparities[out.clone()].copy_from_slice(d0);
            disparities_pp[out.clone()].copy_from_slice(&post_process_disparity(d0, d1, h, w)?);
        }
        if task.has_semantic() {
            let sem = outputs
                .sem_est
                .ok_or_else(|| anyhow!("model produced no semantic logits"))?;
            let classes = sem.dims()[3];
            let logits = sem
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("tensor readback failed: {e:?}"))?;
            let labels = argmax_classes(&logits[..plane * classes], classes);
            semantics[out].copy_from_slice(&labels);
        }
    }
    info!("done.");

    let output_directory = match &args.output_directory {
        Some(dir) => dir.clone(),
        None => restore_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    fs::create_dir_all(&output_directory)
        .with_context(|| format!("failed to create {}", output_directory.display()))?;

    info!(dir = %output_directory.display(), "writing results.");
    let mut written = Vec::new();
    let mut save = |name: &str, data: Vec<f32>| -> anyhow::Result<()> {
        let path = output_directory.join(name);
        let array = Array3::from_shape_vec((num_samples, h, w), data)?;
        write_npy(&path, &array).with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
        Ok(())
    };
    if task.has_depth() {
        save(DISPARITIES_FILE, disparities)?;
        save(DISPARITIES_PP_FILE, disparities_pp)?;
    }
    if task.has_semantic() {
        save(SEMANTICS_FILE, semantics)?;
    }
    info!("done.");

    Ok(TestReport {
        num_samples,
        checkpoint: restore_path,
        written,
    })
}
