use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use burn::lr_scheduler::cosine::CosineAnnealingLrSchedulerConfig;
use burn::lr_scheduler::LrScheduler;
use burn::module::{AutodiffModule, Module};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use clap::{Parser, ValueEnum};
use data_contracts::REGION_ORDER;
use models::{SegResNet, SegResNetConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};
use volume_dataset::transforms::{
    Activations, AsDiscrete, ConvertBratsLabels, Invert, LoadImage, NormalizeIntensity,
    Orientation, RandFlip, RandScaleIntensity, RandShiftIntensity, RandSpatialCrop, Spacing,
};
use volume_dataset::{
    Compose, DatasetResult, DecathlonConfig, DecathlonDataset, Interpolation, LoaderConfig,
    Section, Volume, VolumeLoader, BRAIN_TUMOUR,
};

use crate::amp::LossScaler;
use crate::config::{InferenceSection, PipelineConfig};
use crate::history::{BestMetricTracker, EpochAccumulator, MetricsLog, TrainingHistory};
use crate::inferer::SlidingWindow;
use crate::loss::DiceLoss;
use crate::metrics::{DiceMetric, MetricReduction};
use crate::plot;
use crate::TrainBackend;

pub const CHECKPOINT_NAME: &str = "best_metric_model.bin";

/// Axial plane shown in the inference example.
const EXAMPLE_SLICE: usize = 70;
const PREVIEW_SLICE: usize = 60;
const PREVIEW_CASE: usize = 2;

pub type ADBackend = burn::backend::Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train SegResNet on BraTS (Decathlon Task01) tumour regions"
)]
pub struct TrainArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// TOML config (defaults to $BRATS_SEG_CONFIG, then brats-seg.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Data and output directory (overrides $BRATS_DATA_DIRECTORY).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Validate every N epochs.
    #[arg(long)]
    pub val_interval: Option<usize>,
    /// Initial learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    /// Data loading worker threads.
    #[arg(long)]
    pub workers: Option<usize>,
    /// Dynamic loss scaling on/off.
    #[arg(long)]
    pub amp: Option<bool>,
    /// Seed for weight init, shuffling and augmentation.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Optional metrics output path (JSONL); appends one line per validation.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Fail instead of downloading the task archive when it is missing.
    #[arg(long, default_value_t = false)]
    pub no_download: bool,
}

impl TrainArgs {
    pub fn resolve_config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig::load(self.config.as_deref());
        if let Some(dir) = &self.data_dir {
            cfg.data.root = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            cfg.train.max_epochs = epochs;
        }
        if let Some(interval) = self.val_interval {
            cfg.train.val_interval = interval;
        }
        if let Some(lr) = self.lr {
            cfg.train.lr = lr;
        }
        if let Some(workers) = self.workers {
            cfg.data.num_workers = workers;
        }
        if let Some(amp) = self.amp {
            cfg.train.amp = amp;
        }
        if let Some(seed) = self.seed {
            cfg.train.seed = seed;
        }
        if let Some(path) = &self.metrics_out {
            cfg.train.metrics_out = Some(path.clone());
        }
        if self.no_download {
            cfg.data.download = false;
        }
        cfg
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Score a SegResNet checkpoint on the validation split at original spacing"
)]
pub struct EvalArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// TOML config (defaults to $BRATS_SEG_CONFIG, then brats-seg.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Data directory (overrides $BRATS_DATA_DIRECTORY).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Checkpoint path to load (defaults to <data-dir>/best_metric_model.bin).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Data loading worker threads.
    #[arg(long)]
    pub workers: Option<usize>,
}

impl EvalArgs {
    pub fn resolve_config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig::load(self.config.as_deref());
        if let Some(dir) = &self.data_dir {
            cfg.data.root = dir.clone();
        }
        if let Some(workers) = self.workers {
            cfg.data.eval_workers = workers;
        }
        cfg
    }
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

fn check_task(cfg: &PipelineConfig) -> anyhow::Result<()> {
    if cfg.data.task != BRAIN_TUMOUR.task {
        anyhow::bail!(
            "unsupported Decathlon task `{}`; only {} is available",
            cfg.data.task,
            BRAIN_TUMOUR.task
        );
    }
    Ok(())
}

pub fn train_transforms(cfg: &PipelineConfig) -> DatasetResult<Compose> {
    let keys = ["image", "label"];
    Ok(Compose::new()
        .with(LoadImage::new(&keys))
        .with(ConvertBratsLabels::new("label"))
        .with(Orientation::new(&keys, "RAS"))
        .with(Spacing::new(
            &keys,
            [1.0, 1.0, 1.0],
            &[Interpolation::Bilinear, Interpolation::Nearest],
        )?)
        .with(RandSpatialCrop::new(&keys, cfg.train.roi_size))
        .with(RandFlip::new(&keys, 0.5, 0)?)
        .with(RandFlip::new(&keys, 0.5, 1)?)
        .with(RandFlip::new(&keys, 0.5, 2)?)
        .with(NormalizeIntensity::new(&["image"], true, true))
        .with(RandScaleIntensity::new(&["image"], 0.1, 0.1))
        .with(RandShiftIntensity::new(&["image"], 0.1, 1.0)))
}

pub fn val_transforms() -> DatasetResult<Compose> {
    let keys = ["image", "label"];
    Ok(Compose::new()
        .with(LoadImage::new(&keys))
        .with(ConvertBratsLabels::new("label"))
        .with(Orientation::new(&keys, "RAS"))
        .with(Spacing::new(
            &keys,
            [1.0, 1.0, 1.0],
            &[Interpolation::Bilinear, Interpolation::Nearest],
        )?)
        .with(NormalizeIntensity::new(&["image"], true, true)))
}

/// Labels stay on their original grid; only the image is reoriented and resampled.
pub fn val_org_transforms() -> DatasetResult<Compose> {
    Ok(Compose::new()
        .with(LoadImage::new(&["image", "label"]))
        .with(ConvertBratsLabels::new("label"))
        .with(Orientation::new(&["image"], "RAS"))
        .with(Spacing::new(&["image"], [1.0, 1.0, 1.0], &[Interpolation::Bilinear])?)
        .with(NormalizeIntensity::new(&["image"], true, true)))
}

/// Map `pred` back onto the original image grid, then binarize it.
pub fn post_transforms(threshold: f32) -> Compose {
    Compose::new()
        .with(Invert::new("pred", "image", false))
        .with(Activations::new(&["pred"], true))
        .with(AsDiscrete::new(&["pred"], threshold))
}

fn decathlon_config(cfg: &PipelineConfig, section: Section) -> DecathlonConfig {
    let mut dc = DecathlonConfig::new(&cfg.data.root, section);
    dc.download = cfg.data.download;
    dc.val_frac = cfg.data.val_frac as f32;
    dc.seed = cfg.data.seed;
    dc
}

/// Shuffled training loader and in-order validation loader.
pub fn build_loaders(cfg: &PipelineConfig) -> anyhow::Result<(VolumeLoader, VolumeLoader)> {
    let train_ds = DecathlonDataset::new(
        &decathlon_config(cfg, Section::Training),
        train_transforms(cfg)?,
    )
    .context("failed to prepare training dataset")?;
    let val_ds = DecathlonDataset::new(&decathlon_config(cfg, Section::Validation), val_transforms()?)
        .context("failed to prepare validation dataset")?;
    let train = VolumeLoader::new(
        Arc::new(train_ds),
        LoaderConfig {
            batch_size: cfg.train.batch_size,
            shuffle: true,
            num_workers: cfg.data.num_workers,
            seed: cfg.train.seed,
            keep_samples: false,
        },
    )?;
    let val = VolumeLoader::new(
        Arc::new(val_ds),
        LoaderConfig {
            batch_size: 1,
            shuffle: false,
            num_workers: cfg.data.num_workers,
            seed: cfg.train.seed,
            keep_samples: false,
        },
    )?;
    Ok((train, val))
}

/// Validation loader that keeps host samples for inversion to original spacing.
pub fn build_original_spacing_loader(cfg: &PipelineConfig) -> anyhow::Result<VolumeLoader> {
    let ds = DecathlonDataset::new(
        &decathlon_config(cfg, Section::Validation),
        val_org_transforms()?,
    )
    .context("failed to prepare original-spacing validation dataset")?;
    Ok(VolumeLoader::new(
        Arc::new(ds),
        LoaderConfig {
            batch_size: 1,
            shuffle: false,
            num_workers: cfg.data.eval_workers,
            seed: cfg.train.seed,
            keep_samples: true,
        },
    )?)
}

pub fn load_segresnet_from_checkpoint<B: Backend, P: AsRef<Path>>(
    path: P,
    cfg: &SegResNetConfig,
    device: &B::Device,
) -> Result<SegResNet<B>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    SegResNet::<B>::new(cfg, device).load_file(path.as_ref(), &recorder, device)
}

fn save_checkpoint<B: Backend>(model: &SegResNet<B>, path: &Path) -> anyhow::Result<()> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| anyhow!("failed to save checkpoint: {e}"))
}

/// Mean Dice and per-region Dice in [TC, WT, ET] order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionScores {
    pub mean: f32,
    pub tc: f32,
    pub wt: f32,
    pub et: f32,
}

impl RegionScores {
    fn from_metrics(metric: &DiceMetric, metric_batch: &DiceMetric) -> Self {
        let per_region = metric_batch.aggregate_per_channel();
        let at = |i: usize| per_region.get(i).copied().unwrap_or(0.0);
        Self {
            mean: metric.aggregate_mean(),
            tc: at(0),
            wt: at(1),
            et: at(2),
        }
    }

    pub fn regions(&self) -> [f32; 3] {
        [self.tc, self.wt, self.et]
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or(0.0)
}

fn binarize<B: Backend>(logits: Tensor<B, 5>, threshold: f32) -> Tensor<B, 5> {
    sigmoid(logits).greater_equal_elem(threshold).float()
}

/// Sliding-window Dice over every batch of `loader` on the resampled grid.
pub fn validate<B: Backend>(
    model: &SegResNet<B>,
    loader: &VolumeLoader,
    inference: &InferenceSection,
    device: &B::Device,
) -> anyhow::Result<RegionScores> {
    let inferer = SlidingWindow::new(inference.roi_size, inference.sw_batch_size, inference.overlap);
    let mut metric = DiceMetric::new(MetricReduction::Mean);
    let mut metric_batch = DiceMetric::new(MetricReduction::MeanBatch);
    for batch in loader.iter::<B>(0, device) {
        let batch = batch?;
        let label = batch
            .label
            .ok_or_else(|| anyhow!("validation batch {:?} has no label", batch.indices))?;
        let logits = inferer.infer(batch.image, |x| model.forward(x));
        let pred = binarize(logits, inference.threshold);
        metric.update(pred.clone(), label.clone());
        metric_batch.update(pred, label);
    }
    let scores = RegionScores::from_metrics(&metric, &metric_batch);
    metric.reset();
    metric_batch.reset();
    Ok(scores)
}

/// Dice against untouched labels after mapping predictions back through the
/// image's Spacing and Orientation.
pub fn evaluate_original_spacing<B: Backend>(
    model: &SegResNet<B>,
    loader: &VolumeLoader,
    inference: &InferenceSection,
    device: &B::Device,
) -> anyhow::Result<RegionScores> {
    let inferer = SlidingWindow::new(inference.roi_size, inference.sw_batch_size, inference.overlap);
    let post = post_transforms(inference.threshold);
    let mut rng = StdRng::seed_from_u64(0);
    let mut metric = DiceMetric::new(MetricReduction::Mean);
    let mut metric_batch = DiceMetric::new(MetricReduction::MeanBatch);
    for batch in loader.iter::<B>(0, device) {
        let batch = batch?;
        if batch.samples.is_empty() {
            anyhow::bail!("original-spacing loader must keep host samples");
        }
        let logits = inferer.infer(batch.image, |x| model.forward(x));
        let [_, c, x, y, z] = logits.dims();
        for (i, mut sample) in batch.samples.into_iter().enumerate() {
            let pred = logits
                .clone()
                .slice([i..i + 1, 0..c, 0..x, 0..y, 0..z])
                .reshape([c, x, y, z]);
            let pred = Volume::from_tensor(pred, sample.volume("image")?)?;
            sample.insert_volume("pred", pred);
            let sample = post.apply(sample, &mut rng)?;
            let pred = sample.volume("pred")?;
            let label = sample.volume("label")?;
            if pred.data.dim() != label.data.dim() {
                anyhow::bail!(
                    "sample {}: inverted prediction {:?} does not match label {:?}",
                    sample.index,
                    pred.data.dim(),
                    label.data.dim()
                );
            }
            metric.update_volume(pred.data.view(), label.data.view());
            metric_batch.update_volume(pred.data.view(), label.data.view());
        }
    }
    Ok(RegionScores::from_metrics(&metric, &metric_batch))
}

fn log_region_scores(message: &str, scores: &RegionScores) {
    let regions = scores.regions();
    let detail = REGION_ORDER
        .iter()
        .map(|r| format!("{}={:.4}", r.short_name(), regions[r.channel()]))
        .collect::<Vec<_>>()
        .join(" ");
    info!(mean_dice = scores.mean, "{message}: {detail}");
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub history: TrainingHistory,
    pub best: BestMetricTracker,
    pub checkpoint: PathBuf,
    pub total_secs: f64,
}

/// Epoch loop: Dice loss, loss-scaled Adam steps with cosine-annealed lr,
/// periodic validation and best-checkpoint saving into `out_dir`.
pub fn train_segresnet<B: AutodiffBackend>(
    cfg: &PipelineConfig,
    train_loader: &VolumeLoader,
    val_loader: &VolumeLoader,
    out_dir: &Path,
    device: &B::Device,
) -> anyhow::Result<TrainOutcome> {
    B::seed(cfg.train.seed);
    let max_epochs = cfg.train.max_epochs;
    let val_interval = cfg.train.val_interval.max(1);
    let checkpoint = out_dir.join(CHECKPOINT_NAME);
    let metrics_log = cfg.train.metrics_out.as_ref().map(MetricsLog::new);

    let mut model = SegResNet::<B>::new(&cfg.model, device);
    let mut optim = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(cfg.train.weight_decay as f32)))
        .init();
    let mut scheduler = CosineAnnealingLrSchedulerConfig::new(cfg.train.lr, max_epochs.max(1))
        .init()
        .map_err(|e| anyhow!("invalid cosine schedule: {e}"))?;
    let loss_fn = DiceLoss::default();
    let mut scaler = LossScaler::new(cfg.train.amp);

    let mut history = TrainingHistory::default();
    let mut best = BestMetricTracker::default();
    let steps_per_epoch = train_loader.num_batches();
    let total_start = Instant::now();

    for epoch in 0..max_epochs {
        let epoch_start = Instant::now();
        info!("epoch {}/{}", epoch + 1, max_epochs);
        let lr = scheduler.step();
        let mut acc = EpochAccumulator::default();

        for batch in train_loader.iter::<B>(epoch, device) {
            let step_start = Instant::now();
            let batch = batch?;
            let label = batch
                .label
                .ok_or_else(|| anyhow!("training batch {:?} has no label", batch.indices))?;
            let logits = model.forward(batch.image);
            let loss = loss_fn.forward(logits, label);
            let loss_value = scalar(loss.clone().detach());

            let mut grads = GradientsParams::from_grads(scaler.scale(loss).backward(), &model);
            let found_inf = scaler.unscale::<B, _>(&mut grads, &model);
            if found_inf {
                warn!(scale = scaler.scale_factor(), "non-finite gradients; skipping optimizer step");
            } else {
                model = optim.step(lr, model, grads);
            }
            scaler.update(found_inf);

            acc.add(loss_value);
            info!(
                "{}/{}, train_loss: {:.4}, step time: {:.4}",
                acc.steps(),
                steps_per_epoch,
                loss_value,
                step_start.elapsed().as_secs_f64()
            );
        }

        let epoch_loss = acc.average();
        history.record_loss(epoch_loss);
        info!("epoch {} average loss: {:.4}", epoch + 1, epoch_loss);

        if (epoch + 1) % val_interval == 0 {
            let valid_model = model.valid();
            let scores = validate::<B::InnerBackend>(&valid_model, val_loader, &cfg.inference, device)?;
            history.record_validation(scores.mean, &scores.regions());
            let elapsed = total_start.elapsed().as_secs_f64();
            if best.update(scores.mean, epoch + 1, elapsed) {
                save_checkpoint(&valid_model, &checkpoint)?;
                info!(path = %checkpoint.display(), "saved new best metric model");
            }
            info!(
                "current epoch: {} current mean dice: {:.4} tc: {:.4} wt: {:.4} et: {:.4}",
                epoch + 1,
                scores.mean,
                scores.tc,
                scores.wt,
                scores.et
            );
            info!(
                "best mean dice: {:.4} at epoch: {}",
                best.best_metric,
                best.best_epoch.unwrap_or(0)
            );
            if let Some(log) = &metrics_log {
                let line = serde_json::json!({
                    "epoch": epoch + 1,
                    "seed": cfg.train.seed,
                    "lr": lr,
                    "loss": epoch_loss,
                    "mean_dice": scores.mean,
                    "tc": scores.tc,
                    "wt": scores.wt,
                    "et": scores.et,
                    "best_metric": best.best_metric,
                    "best_epoch": best.best_epoch,
                    "elapsed_secs": elapsed,
                });
                if let Err(err) = log.append(&line) {
                    warn!(path = %log.path().display(), %err, "failed to append metrics");
                }
            }
        }
        info!(
            "time consuming of epoch {} is: {:.4}",
            epoch + 1,
            epoch_start.elapsed().as_secs_f64()
        );
    }

    if best.best_epoch.is_none() {
        warn!("no validation ran; saving the final weights as the checkpoint");
        save_checkpoint(&model.valid(), &checkpoint)?;
    }

    let total_secs = total_start.elapsed().as_secs_f64();
    info!(
        "train completed, best_metric: {:.4} at epoch: {}, total time: {:.1}s",
        best.best_metric,
        best.best_epoch.unwrap_or(0),
        total_secs
    );
    Ok(TrainOutcome {
        history,
        best,
        checkpoint,
        total_secs,
    })
}

/// Shapes of the previewed validation case and the panels written for it.
#[derive(Debug, Clone)]
pub struct DataPreview {
    pub index: usize,
    pub image_shape: [usize; 4],
    pub label_shape: [usize; 4],
    pub files: Vec<PathBuf>,
}

/// Third validation case, or the last one when there are fewer.
pub fn preview_case_index(len: usize) -> Option<usize> {
    len.checked_sub(1).map(|last| PREVIEW_CASE.min(last))
}

/// Logs the shapes of one validation case and plots its image channels and
/// label regions. Plotting failures are logged and leave `files` empty.
pub fn render_data_example(loader: &VolumeLoader, out_dir: &Path) -> anyhow::Result<DataPreview> {
    let dataset = loader.dataset();
    let index = preview_case_index(dataset.len()).ok_or_else(|| anyhow!("validation set is empty"))?;
    let sample = dataset.get(index, &mut StdRng::seed_from_u64(0))?;
    let image = sample.volume("image")?;
    let label = sample.volume("label")?;
    let shape = |v: &Volume| {
        let (c, x, y, z) = v.data.dim();
        [c, x, y, z]
    };
    let (image_shape, label_shape) = (shape(image), shape(label));
    info!(index, ?image_shape, "image shape");
    info!(index, ?label_shape, "label shape");

    let mut files = Vec::new();
    for (prefix, file, volume) in [
        ("image", "data_image.png", image),
        ("label", "data_label.png", label),
    ] {
        let path = out_dir.join(file);
        let panels = plot::axial_panels(prefix, volume.data.view(), PREVIEW_SLICE);
        match plot::plot_slices_png(&path, &panels) {
            Ok(()) => files.push(path),
            Err(e) => {
                warn!(file, error = %e, "skipping data preview");
                break;
            }
        }
    }
    Ok(DataPreview {
        index,
        image_shape,
        label_shape,
        files,
    })
}

/// Slice panels of the first validation case: input channels, label regions
/// and the thresholded prediction.
pub fn render_inference_example<B: Backend>(
    model: &SegResNet<B>,
    loader: &VolumeLoader,
    inference: &InferenceSection,
    out_dir: &Path,
    device: &B::Device,
) -> anyhow::Result<Vec<PathBuf>> {
    let dataset = loader.dataset();
    if dataset.is_empty() {
        anyhow::bail!("validation set is empty");
    }
    let sample = dataset.get(0, &mut StdRng::seed_from_u64(0))?;
    let image = sample.volume("image")?;
    let label = sample.volume("label")?;

    let inferer = SlidingWindow::new(inference.roi_size, inference.sw_batch_size, inference.overlap);
    let input: Tensor<B, 5> = image.to_tensor::<B>(device).unsqueeze();
    let pred = binarize(inferer.infer(input, |x| model.forward(x)), inference.threshold);
    let [_, c, x, y, z] = pred.dims();
    let pred = Volume::from_tensor(pred.reshape([c, x, y, z]), image)?;

    let outputs = [
        ("image", "inference_image.png", image),
        ("label", "inference_label.png", label),
        ("output", "inference_output.png", &pred),
    ];
    let mut written = Vec::with_capacity(outputs.len());
    for (prefix, file, volume) in outputs {
        let path = out_dir.join(file);
        let panels = plot::axial_panels(prefix, volume.data.view(), EXAMPLE_SLICE);
        plot::plot_slices_png(&path, &panels).map_err(|e| anyhow!("{file}: {e}"))?;
        written.push(path);
    }
    Ok(written)
}

/// Full pipeline behind the `train` binary.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve_config();
    check_task(&cfg)?;
    let out_dir = cfg.data.root.clone();
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    info!(root = %out_dir.display(), epochs = cfg.train.max_epochs, amp = cfg.train.amp, "starting training");

    let (train_loader, val_loader) = build_loaders(&cfg)?;
    let preview = render_data_example(&val_loader, &out_dir)?;
    if !preview.files.is_empty() {
        info!(files = ?preview.files, "wrote data preview");
    }
    let device = <ADBackend as Backend>::Device::default();
    let outcome = train_segresnet::<ADBackend>(&cfg, &train_loader, &val_loader, &out_dir, &device)?;

    match plot::plot_training_curves(&out_dir, &outcome.history, cfg.train.val_interval) {
        Ok(files) => info!(?files, "wrote training curves"),
        Err(e) => warn!(error = %e, "skipping training curves"),
    }

    let device = <TrainBackend as Backend>::Device::default();
    let model = load_segresnet_from_checkpoint::<TrainBackend, _>(&outcome.checkpoint, &cfg.model, &device)
        .map_err(|e| anyhow!("failed to load {}: {e}", outcome.checkpoint.display()))?;
    match render_inference_example(&model, &val_loader, &cfg.inference, &out_dir, &device) {
        Ok(files) => info!(?files, "wrote inference example"),
        Err(e) => warn!(error = %e, "skipping inference example"),
    }

    let org_loader = build_original_spacing_loader(&cfg)?;
    let scores = evaluate_original_spacing(&model, &org_loader, &cfg.inference, &device)?;
    log_region_scores("metric on original image spacing", &scores);
    Ok(())
}

/// Original-spacing evaluation behind the `eval` binary.
pub fn run_eval(args: EvalArgs) -> anyhow::Result<RegionScores> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve_config();
    check_task(&cfg)?;
    let checkpoint = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| cfg.data.root.join(CHECKPOINT_NAME));

    let device = <TrainBackend as Backend>::Device::default();
    let model = load_segresnet_from_checkpoint::<TrainBackend, _>(&checkpoint, &cfg.model, &device)
        .map_err(|e| anyhow!("failed to load {}: {e}", checkpoint.display()))?;
    info!(checkpoint = %checkpoint.display(), "loaded model");

    let loader = build_original_spacing_loader(&cfg)?;
    let scores = evaluate_original_spacing(&model, &loader, &cfg.inference, &device)?;
    log_region_scores("metric on original image spacing", &scores);
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config() {
        let args = TrainArgs::parse_from([
            "train",
            "--data-dir",
            "/tmp/brats",
            "--epochs",
            "3",
            "--amp",
            "false",
            "--lr",
            "0.001",
            "--no-download",
        ]);
        let cfg = args.resolve_config();
        assert_eq!(cfg.data.root, PathBuf::from("/tmp/brats"));
        assert_eq!(cfg.train.max_epochs, 3);
        assert!(!cfg.train.amp);
        assert_eq!(cfg.train.lr, 0.001);
        assert!(!cfg.data.download);
    }

    #[test]
    fn pipelines_run_in_registration_order() {
        let cfg = PipelineConfig::default();
        let train = train_transforms(&cfg).unwrap();
        assert_eq!(train.len(), 11);
        assert!(train.describe().starts_with("LoadImage -> ConvertBratsLabels -> Orientation -> Spacing"));
        assert_eq!(val_transforms().unwrap().len(), 5);
        assert_eq!(val_org_transforms().unwrap().len(), 5);
        assert_eq!(post_transforms(0.5).describe(), "Invert -> Activations -> AsDiscrete");
    }

    #[test]
    fn wgpu_requires_the_feature() {
        let result = validate_backend_choice(BackendKind::Wgpu);
        assert_eq!(result.is_ok(), cfg!(feature = "backend-wgpu"));
    }

    #[test]
    fn preview_prefers_the_third_case() {
        assert_eq!(preview_case_index(0), None);
        assert_eq!(preview_case_index(1), Some(0));
        assert_eq!(preview_case_index(2), Some(1));
        assert_eq!(preview_case_index(50), Some(2));
    }

    #[test]
    fn only_task01_is_supported() {
        let mut cfg = PipelineConfig::default();
        assert!(check_task(&cfg).is_ok());
        cfg.data.task = "Task02_Heart".into();
        assert!(check_task(&cfg).is_err());
    }
}
