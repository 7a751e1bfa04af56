//! Synchronous multi-tower training.

use crate::checkpoint::Checkpoint;
use crate::config::RunArgs;
use crate::gradients::{average_gradients, ensure_complete, TowerGradients};
use crate::optimizer::{adam, Adam, WeightParams};
use crate::schedule::PiecewiseConstant;
use crate::summary::SummaryWriter;
use crate::surgery::{plan_restore, RestorePlan};
use crate::{ADBackend, TrainBackend};
use anyhow::{anyhow, bail, Context};
use burn::tensor::backend::Backend;
use burn::optim::Optimizer;
use burn::tensor::ElementConversion;
use models::{ModelInputs, PointwiseStereoModel, StereoModel, VariableId, WeightSet};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;
use stereo_dataset::{
    read_file_list, AssemblerConfig, BatchAssembler, DataLayout, Mode, SampleLoader, StereoBatch,
};
use tracing::{info, warn};

pub const LOG_EVERY_STEPS: usize = 100;
pub const PARAMS_FILE: &str = "params.json";

#[derive(Debug, Clone, PartialEq)]
pub struct StepCounts {
    pub num_samples: usize,
    pub steps_per_epoch: usize,
    pub total_steps: usize,
}

impl StepCounts {
    pub fn new(num_samples: usize, batch_size: usize, num_epochs: usize) -> Self {
        let steps_per_epoch = num_samples.div_ceil(batch_size.max(1));
        Self {
            num_samples,
            steps_per_epoch,
            total_steps: num_epochs * steps_per_epoch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub start_step: usize,
    pub total_steps: usize,
    pub last_loss: Option<f32>,
    pub checkpoint: PathBuf,
}

/// Weights plus the restore plan derived from `--checkpoint-path`.
pub(crate) struct Restored {
    pub weights: WeightSet<TrainBackend>,
    pub plan: RestorePlan,
    pub global_step: usize,
    pub source: Option<PathBuf>,
}

pub(crate) fn restore_weights<M: StereoModel>(
    model: &M,
    args: &RunArgs,
    checkpoint: Option<&Path>,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<Restored> {
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut weights = WeightSet::<TrainBackend>::initialize(model.variables(), seed, device);
    let current = model.variable_ids();
    let Some(path) = checkpoint else {
        return Ok(Restored {
            weights,
            plan: RestorePlan::fresh(&current),
            global_step: 0,
            source: None,
        });
    };

    let ckpt = Checkpoint::load(path)
        .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
    let plan = plan_restore(&ckpt.inventory(), &current, args.cascade_policy);
    info!(
        restore = plan.restore.len(),
        total = current.len(),
        "vars to restore {} vs total vars {}",
        plan.restore.len(),
        current.len()
    );
    ckpt.restore_into(&mut weights, &plan.restore, device)
        .with_context(|| format!("failed to restore from {}", path.display()))?;
    info!(path = %path.display(), "weights restored");
    Ok(Restored {
        weights,
        plan,
        global_step: ckpt.global_step,
        source: Some(path.to_path_buf()),
    })
}

fn write_params(run_dir: &Path, args: &RunArgs) -> anyhow::Result<()> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;
    let path = run_dir.join(PARAMS_FILE);
    let json = serde_json::to_vec_pretty(args)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Forward and backward for one shard against a shared weight snapshot.
fn run_tower<M: StereoModel>(
    model: &M,
    weights: &WeightSet<TrainBackend>,
    shard: &StereoBatch,
    optimize: &BTreeSet<VariableId>,
    order: &[VariableId],
    tower: usize,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<(TowerGradients<TrainBackend>, f32)> {
    let leaves = WeightSet::<ADBackend>::lift(weights, |id| optimize.contains(id));
    let inputs = ModelInputs::from(shard.to_tensors::<ADBackend>(device));
    let outputs = model.forward(&leaves, &inputs, tower)?;
    let loss = outputs
        .total_loss
        .ok_or_else(|| anyhow!("model produced no loss in training mode"))?;
    let loss_value: f32 = loss.clone().into_scalar().elem();
    let grads = loss.backward();
    Ok((leaves.gradients(&grads, order), loss_value))
}

/// One synchronous step: every tower runs on its shard, all are joined, then
/// the averaged gradients are applied once.
#[allow(clippy::too_many_arguments)]
fn train_step<M: StereoModel, O: Optimizer<WeightParams<ADBackend>, ADBackend>>(
    model: &M,
    weights: &mut WeightSet<TrainBackend>,
    adam: &mut Adam<ADBackend, O>,
    batch: &StereoBatch,
    num_towers: usize,
    plan: &RestorePlan,
    learning_rate: f64,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<f32> {
    let shards = batch.split(num_towers)?;
    let optimize: BTreeSet<VariableId> = plan.optimize.iter().cloned().collect();
    let order = model.variable_ids();

    let snapshot: &WeightSet<TrainBackend> = weights;
    let results: Vec<anyhow::Result<(TowerGradients<TrainBackend>, f32)>> = thread::scope(|s| {
        let handles: Vec<_> = shards
            .iter()
            .enumerate()
            .map(|(tower, shard)| {
                let (optimize, order) = (&optimize, order.as_slice());
                s.spawn(move || run_tower(model, snapshot, shard, optimize, order, tower, device))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(tower, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("tower {tower} panicked")))
            })
            .collect()
    });

    let mut tower_grads = Vec::with_capacity(num_towers);
    let mut losses = Vec::with_capacity(num_towers);
    for result in results {
        let (grads, loss) = result?;
        tower_grads.push(grads);
        losses.push(loss);
    }
    let averaged = average_gradients(tower_grads)?;
    ensure_complete(&averaged, &plan.optimize)?;
    adam.step(weights, &averaged, learning_rate)?;
    Ok(losses.iter().sum::<f32>() / losses.len() as f32)
}

fn weight_norms(weights: &WeightSet<TrainBackend>) -> anyhow::Result<Vec<(String, f64)>> {
    Ok(weights
        .to_host()?
        .into_iter()
        .map(|v| {
            let norm = v.values.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
            (format!("weights/{}", v.id), norm)
        })
        .collect())
}

pub fn run_train(args: &RunArgs) -> anyhow::Result<TrainReport> {
    args.validate()?;
    let entries = read_file_list(&args.filenames_file, 2)?;
    if entries.is_empty() {
        bail!("file list {} has no samples", args.filenames_file.display());
    }
    let counts = StepCounts::new(entries.len(), args.batch_size, args.num_epochs);
    let schedule = PiecewiseConstant::for_run(args.learning_rate, counts.total_steps);
    info!("total number of samples: {}", counts.num_samples);
    info!("total number of steps: {}", counts.total_steps);

    let run_dir = args.run_dir();
    write_params(&run_dir, args)?;
    let mut summaries = SummaryWriter::open(&run_dir)
        .with_context(|| format!("failed to open summaries under {}", run_dir.display()))?;

    let device = <TrainBackend as Backend>::Device::default();
    let model = PointwiseStereoModel::new(args.model_params(), Mode::Train, args.task);
    let restored = restore_weights(&model, args, args.checkpoint_path.as_deref(), &device)?;
    let Restored {
        mut weights,
        plan,
        global_step,
        ..
    } = restored;
    let start_step = if args.retrain { 0 } else { global_step };
    info!(
        "vars to optimize {} vs total vars {}",
        plan.optimize.len(),
        model.variables().len()
    );
    info!("number of trainable parameters: {}", model.parameter_count());
    if start_step >= counts.total_steps {
        warn!(start_step, total = counts.total_steps, "restored step is past the end of the run");
    }

    let loader = SampleLoader {
        layout: DataLayout::new(&args.data_path, args.dataset),
        target: args.target(),
        sem_mask: args.sem_mask,
        mode: Mode::Train,
        do_stereo: args.do_stereo,
        augment: args.augment(),
    };
    let assembler_cfg = AssemblerConfig {
        batch_size: args.batch_size,
        num_workers: args.num_threads,
        shuffle: !args.no_shuffle,
        min_after_dequeue: args.min_after_dequeue,
        epochs: None,
        seed: args.seed,
    };
    let mut assembler = BatchAssembler::spawn(entries, loader, assembler_cfg)?;
    let mut optimizer = adam::<ADBackend>();

    let start = Instant::now();
    let mut last_loss = None;
    for step in start_step..counts.total_steps {
        let before = Instant::now();
        let batch = assembler
            .next_batch()?
            .ok_or_else(|| anyhow!("data stream ended at step {step}"))?;
        let learning_rate = schedule.value(step);
        let loss = train_step(
            &model,
            &mut weights,
            &mut optimizer,
            &batch,
            args.num_gpus,
            &plan,
            learning_rate,
            &device,
        )
        .with_context(|| format!("training step {step} failed"))?;
        last_loss = Some(loss);
        let duration = before.elapsed().as_secs_f64();

        if step > 0 && step % LOG_EVERY_STEPS == 0 {
            let examples_per_sec = args.batch_size as f64 / duration.max(1e-9);
            let hours_so_far = start.elapsed().as_secs_f64() / 3600.0;
            let hours_left = (counts.total_steps as f64 / step as f64 - 1.0) * hours_so_far;
            info!(
                "batch {:>6} | examples/s: {:4.2} | loss: {:.5} | time elapsed: {:.2}h | time left: {:.2}h",
                step, examples_per_sec, loss, hours_so_far, hours_left
            );
            summaries.scalar(step, "learning_rate", learning_rate)?;
            summaries.scalar(step, "total_loss", loss as f64)?;
            if args.full_summary {
                for (tag, norm) in weight_norms(&weights)? {
                    summaries.scalar(step, &tag, norm)?;
                }
            }
            summaries.flush()?;
        }
    }
    summaries.flush()?;

    let checkpoint = Checkpoint::capture(counts.total_steps, &weights)?.save(&run_dir)?;
    info!(path = %checkpoint.display(), "saved checkpoint");
    Ok(TrainReport {
        start_step,
        total_steps: counts.total_steps,
        last_loss,
        checkpoint,
    })
}
