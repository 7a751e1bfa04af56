//! Batch assembly for training (parallel producers) and testing (one sample at a time).

use crate::filelist::FileListEntry;
use crate::loader::SampleLoader;
use crate::shutdown::ShutdownSignal;
use crate::types::{DatasetError, DatasetResult, ImageTensor, StereoSample};
use crossbeam_channel::{bounded, select, Receiver, Select, Sender, TryRecvError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Samples kept buffered before a randomized batch may be drawn.
pub const DEFAULT_MIN_AFTER_DEQUEUE: usize = 2048;
pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// Collated samples in NHWC layout.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoBatch {
    pub size: usize,
    pub height: usize,
    pub width: usize,
    pub left: Vec<f32>,
    pub right: Option<Vec<f32>>,
    /// N×H×W×1 category ids.
    pub semantic: Vec<i32>,
    /// N×H×W×1 validity mask.
    pub valid: Vec<f32>,
}

impl StereoBatch {
    pub fn collate(samples: &[StereoSample]) -> DatasetResult<Self> {
        let Some(first) = samples.first() else {
            return Err(DatasetError::Config("cannot collate empty batch".to_string()));
        };
        let (height, width) = (first.left.height, first.left.width);
        let stereo = first.right.is_some();
        let pixels = height * width;

        let mut left = Vec::with_capacity(samples.len() * pixels * 3);
        let mut right = stereo.then(|| Vec::with_capacity(samples.len() * pixels * 3));
        let mut semantic = Vec::with_capacity(samples.len() * pixels);
        let mut valid = Vec::with_capacity(samples.len() * pixels);
        for sample in samples {
            if sample.left.height != height || sample.left.width != width {
                return Err(DatasetError::Config(format!(
                    "batch contains varying image sizes: {}x{} vs {}x{}",
                    sample.left.width, sample.left.height, width, height
                )));
            }
            left.extend_from_slice(&sample.left.data);
            match (right.as_mut(), sample.right.as_ref()) {
                (Some(buf), Some(r)) => buf.extend_from_slice(&r.data),
                (None, None) => {}
                _ => {
                    return Err(DatasetError::Config(
                        "batch mixes stereo and monocular samples".to_string(),
                    ))
                }
            }
            semantic.extend_from_slice(&sample.semantic.ids);
            valid.extend_from_slice(&sample.valid.data);
        }
        Ok(Self {
            size: samples.len(),
            height,
            width,
            left,
            right,
            semantic,
            valid,
        })
    }

    /// Split along the batch axis into `parts` equal shards.
    pub fn split(&self, parts: usize) -> DatasetResult<Vec<StereoBatch>> {
        if parts == 0 || self.size % parts != 0 {
            return Err(DatasetError::Config(format!(
                "batch of {} cannot be split into {} equal shards",
                self.size, parts
            )));
        }
        let n = self.size / parts;
        let px = self.height * self.width;
        Ok((0..parts)
            .map(|i| StereoBatch {
                size: n,
                height: self.height,
                width: self.width,
                left: self.left[i * n * px * 3..(i + 1) * n * px * 3].to_vec(),
                right: self
                    .right
                    .as_ref()
                    .map(|r| r[i * n * px * 3..(i + 1) * n * px * 3].to_vec()),
                semantic: self.semantic[i * n * px..(i + 1) * n * px].to_vec(),
                valid: self.valid[i * n * px..(i + 1) * n * px].to_vec(),
            })
            .collect())
    }

    /// Left view of item `i` as an image.
    pub fn left_image(&self, i: usize) -> ImageTensor {
        let len = self.height * self.width * 3;
        ImageTensor::from_vec(
            self.height,
            self.width,
            3,
            self.left[i * len..(i + 1) * len].to_vec(),
        )
    }

    #[cfg(feature = "burn-runtime")]
    pub fn to_tensors<B: burn::tensor::backend::Backend>(
        &self,
        device: &B::Device,
    ) -> BurnStereoBatch<B> {
        use burn::tensor::{Tensor, TensorData};
        let image_shape = [self.size, self.height, self.width, 3];
        let mask_shape = [self.size, self.height, self.width, 1];
        let semantic: Vec<f32> = self.semantic.iter().map(|&id| id as f32).collect();

        let left = Tensor::<B, 4>::from_data(TensorData::new(self.left.clone(), image_shape), device);
        let right = self.right.as_ref().map(|r| {
            Tensor::<B, 4>::from_data(TensorData::new(r.clone(), image_shape), device)
        });
        let semantic = Tensor::<B, 4>::from_data(TensorData::new(semantic, mask_shape), device);
        let valid = Tensor::<B, 4>::from_data(TensorData::new(self.valid.clone(), mask_shape), device);
        BurnStereoBatch {
            left,
            right,
            semantic,
            valid,
        }
    }
}

#[cfg(feature = "burn-runtime")]
#[derive(Debug, Clone)]
pub struct BurnStereoBatch<B: burn::tensor::backend::Backend> {
    pub left: burn::tensor::Tensor<B, 4>,
    pub right: Option<burn::tensor::Tensor<B, 4>>,
    /// Category ids stored as floats.
    pub semantic: burn::tensor::Tensor<B, 4>,
    pub valid: burn::tensor::Tensor<B, 4>,
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Randomized draws from a shuffle buffer instead of strict file order.
    pub shuffle: bool,
    pub min_after_dequeue: usize,
    /// Passes over the file list; `None` repeats forever.
    pub epochs: Option<usize>,
    pub seed: Option<u64>,
}

impl AssemblerConfig {
    pub fn new(batch_size: usize, num_workers: usize, shuffle: bool) -> Self {
        Self {
            batch_size,
            num_workers,
            shuffle,
            min_after_dequeue: DEFAULT_MIN_AFTER_DEQUEUE,
            epochs: None,
            seed: None,
        }
    }

    /// `min_after_dequeue + 4 * batch_size`.
    pub fn capacity(&self) -> usize {
        self.min_after_dequeue + 4 * self.batch_size
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssemblerStats {
    pub batches: usize,
    pub samples: usize,
    /// Samples buffered just before the latest randomized draw.
    pub last_draw_depth: usize,
    pub wait_time: Duration,
}

type WorkerMessage = DatasetResult<StereoSample>;

/// Fixed-size batches fed by `num_workers` producer threads.
///
/// Sample `seq` of the (repeating) file-list stream is decoded by worker
/// `seq % num_workers`, and each worker owns a bounded channel, so a full
/// channel blocks its producer. Ordered mode reads sequence numbers in turn;
/// randomized mode keeps a shuffle buffer and only draws once
/// `min_after_dequeue + batch_size` samples are buffered, unless every
/// producer has already finished.
pub struct BatchAssembler {
    cfg: AssemblerConfig,
    receivers: Vec<Receiver<WorkerMessage>>,
    live: Vec<bool>,
    received: Vec<u64>,
    total: Option<u64>,
    next_seq: u64,
    buffer: Vec<StereoSample>,
    rng: StdRng,
    shutdown: ShutdownSignal,
    workers: Vec<JoinHandle<()>>,
    finished: bool,
    stats: AssemblerStats,
    started: Instant,
    last_log: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
}

impl BatchAssembler {
    pub fn spawn(
        entries: Vec<FileListEntry>,
        loader: SampleLoader,
        cfg: AssemblerConfig,
    ) -> DatasetResult<Self> {
        Self::spawn_with_shutdown(entries, loader, cfg, ShutdownSignal::new())
    }

    pub fn spawn_with_shutdown(
        entries: Vec<FileListEntry>,
        loader: SampleLoader,
        cfg: AssemblerConfig,
        shutdown: ShutdownSignal,
    ) -> DatasetResult<Self> {
        if cfg.batch_size == 0 || cfg.num_workers == 0 {
            return Err(DatasetError::Config(
                "batch_size and num_workers must be positive".to_string(),
            ));
        }
        if entries.is_empty() {
            return Err(DatasetError::Config("file list is empty".to_string()));
        }
        let total = cfg.epochs.map(|e| (e * entries.len()) as u64);
        let per_worker = if cfg.shuffle {
            cfg.batch_size
        } else {
            cfg.capacity().div_ceil(cfg.num_workers)
        }
        .max(1);

        let entries = Arc::new(entries);
        let loader = Arc::new(loader);
        let mut receivers = Vec::with_capacity(cfg.num_workers);
        let mut workers = Vec::with_capacity(cfg.num_workers);
        for index in 0..cfg.num_workers {
            let (tx, rx) = bounded(per_worker);
            let job = WorkerJob {
                index,
                stride: cfg.num_workers as u64,
                total,
                entries: Arc::clone(&entries),
                loader: Arc::clone(&loader),
                shutdown: shutdown.clone(),
                seed: cfg.seed,
            };
            let handle = thread::Builder::new()
                .name(format!("stereo-loader-{index}"))
                .spawn(move || job.run(tx));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.trigger();
                    return Err(DatasetError::Spawn(e));
                }
            }
            receivers.push(rx);
        }

        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let log_every_samples = match std::env::var("STEREO_DATASET_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
        };
        let now = Instant::now();
        Ok(Self {
            live: vec![true; cfg.num_workers],
            received: vec![0; cfg.num_workers],
            buffer: Vec::with_capacity(if cfg.shuffle { cfg.capacity() } else { 0 }),
            cfg,
            receivers,
            total,
            next_seq: 0,
            rng,
            shutdown,
            workers,
            finished: false,
            stats: AssemblerStats::default(),
            started: now,
            last_log: now,
            last_logged_samples: 0,
            log_every_samples,
        })
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Next full batch; `Ok(None)` once the stream is exhausted. A trailing
    /// partial batch is dropped.
    pub fn next_batch(&mut self) -> DatasetResult<Option<StereoBatch>> {
        if self.shutdown.is_triggered() {
            return Err(DatasetError::Cancelled);
        }
        if self.finished {
            return Ok(None);
        }
        let t_wait = Instant::now();
        let samples = if self.cfg.shuffle {
            self.next_randomized()?
        } else {
            self.next_ordered()?
        };
        self.stats.wait_time += t_wait.elapsed();
        let Some(samples) = samples else {
            self.finished = true;
            return Ok(None);
        };
        let batch = StereoBatch::collate(&samples)?;
        self.stats.batches += 1;
        self.stats.samples += batch.size;
        self.maybe_log_progress();
        Ok(Some(batch))
    }

    fn next_ordered(&mut self) -> DatasetResult<Option<Vec<StereoSample>>> {
        let mut samples = Vec::with_capacity(self.cfg.batch_size);
        while samples.len() < self.cfg.batch_size {
            if self.shutdown.is_triggered() {
                return Err(DatasetError::Cancelled);
            }
            let worker = (self.next_seq % self.cfg.num_workers as u64) as usize;
            let msg = select! {
                recv(self.receivers[worker]) -> msg => msg,
                recv(self.shutdown.receiver()) -> _ => return Err(DatasetError::Cancelled),
            };
            match msg {
                Ok(sample) => {
                    samples.push(self.accept(worker, sample)?);
                    self.next_seq += 1;
                }
                Err(_) => {
                    self.worker_disconnected(worker)?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(samples))
    }

    fn next_randomized(&mut self) -> DatasetResult<Option<Vec<StereoSample>>> {
        let batch_size = self.cfg.batch_size;
        let need = self.cfg.min_after_dequeue + batch_size;
        loop {
            self.drain_ready()?;
            if self.buffer.len() >= need || !self.live.iter().any(|l| *l) {
                break;
            }
            self.recv_any()?;
        }
        if self.buffer.len() < batch_size {
            return Ok(None);
        }
        self.stats.last_draw_depth = self.buffer.len();
        let mut picked = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let idx = self.rng.random_range(0..self.buffer.len());
            picked.push(self.buffer.swap_remove(idx));
        }
        Ok(Some(picked))
    }

    /// Move already-queued samples into the shuffle buffer without blocking.
    fn drain_ready(&mut self) -> DatasetResult<()> {
        let capacity = self.cfg.capacity();
        for worker in 0..self.receivers.len() {
            while self.live[worker] && self.buffer.len() < capacity {
                match self.receivers[worker].try_recv() {
                    Ok(msg) => {
                        let sample = self.accept(worker, msg)?;
                        self.buffer.push(sample);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => self.worker_disconnected(worker)?,
                }
            }
        }
        Ok(())
    }

    /// Block until any live producer delivers (or finishes).
    fn recv_any(&mut self) -> DatasetResult<()> {
        let (worker, msg) = {
            let live: Vec<usize> = (0..self.receivers.len()).filter(|i| self.live[*i]).collect();
            let mut sel = Select::new();
            for &i in &live {
                sel.recv(&self.receivers[i]);
            }
            let shutdown_op = sel.recv(self.shutdown.receiver());
            let oper = sel.select();
            if oper.index() == shutdown_op {
                let _ = oper.recv(self.shutdown.receiver());
                return Err(DatasetError::Cancelled);
            }
            let worker = live[oper.index()];
            (worker, oper.recv(&self.receivers[worker]))
        };
        match msg {
            Ok(msg) => {
                let sample = self.accept(worker, msg)?;
                self.buffer.push(sample);
                Ok(())
            }
            Err(_) => self.worker_disconnected(worker),
        }
    }

    fn accept(&mut self, worker: usize, msg: WorkerMessage) -> DatasetResult<StereoSample> {
        match msg {
            Ok(sample) => {
                self.received[worker] += 1;
                Ok(sample)
            }
            Err(e) => {
                self.shutdown.trigger();
                Err(e)
            }
        }
    }

    /// A producer hung up: fine once it delivered its whole share, a failure otherwise.
    fn worker_disconnected(&mut self, worker: usize) -> DatasetResult<()> {
        self.live[worker] = false;
        let stride = self.cfg.num_workers as u64;
        let expected = self.total.map(|total| {
            let w = worker as u64;
            if total > w {
                (total - w - 1) / stride + 1
            } else {
                0
            }
        });
        if expected == Some(self.received[worker]) {
            Ok(())
        } else {
            self.shutdown.trigger();
            Err(DatasetError::WorkerStopped(worker))
        }
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let processed_since = self.stats.samples.saturating_sub(self.last_logged_samples);
        if processed_since < threshold && self.last_log.elapsed() < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        debug!(
            batches = self.stats.batches,
            samples = self.stats.samples,
            buffered = self.buffer.len(),
            rate = self.stats.samples as f32 / secs,
            wait_ms = self.stats.wait_time.as_secs_f64() * 1000.0,
            "[dataset] progress"
        );
        self.last_logged_samples = self.stats.samples;
        self.last_log = Instant::now();
    }
}

impl Drop for BatchAssembler {
    fn drop(&mut self) {
        self.shutdown.trigger();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct WorkerJob {
    index: usize,
    stride: u64,
    total: Option<u64>,
    entries: Arc<Vec<FileListEntry>>,
    loader: Arc<SampleLoader>,
    shutdown: ShutdownSignal,
    seed: Option<u64>,
}

impl WorkerJob {
    fn run(self, tx: Sender<WorkerMessage>) {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ (self.index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let n = self.entries.len() as u64;
        let mut seq = self.index as u64;
        while self.total.is_none_or(|total| seq < total) {
            if self.shutdown.is_triggered() {
                return;
            }
            let entry = &self.entries[(seq % n) as usize];
            let msg = self.loader.load(entry, &mut rng);
            let failed = msg.is_err();
            select! {
                send(tx, msg) -> res => {
                    if res.is_err() {
                        return;
                    }
                }
                recv(self.shutdown.receiver()) -> _ => return,
            }
            if failed {
                return;
            }
            seq += self.stride;
        }
    }
}

/// Test-time loader: one sample per call, paired with its mirror image.
pub struct TestLoader {
    entries: Vec<FileListEntry>,
    loader: SampleLoader,
    cursor: usize,
}

impl TestLoader {
    pub fn new(entries: Vec<FileListEntry>, loader: SampleLoader) -> Self {
        Self {
            entries,
            loader,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `{sample, mirrored sample}` for the next entry.
    pub fn next_batch(&mut self) -> DatasetResult<Option<StereoBatch>> {
        let Some(entry) = self.entries.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let sample = self.loader.decode(entry)?;
        let mirrored = StereoSample {
            left: sample.left.mirrored(),
            right: sample.right.as_ref().map(ImageTensor::mirrored),
            semantic: sample.semantic.mirrored(),
            valid: sample.valid.mirrored(),
        };
        StereoBatch::collate(&[sample, mirrored]).map(Some)
    }
}
