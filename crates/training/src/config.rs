use std::path::{Path, PathBuf};

use models::SegResNetConfig;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_CONFIG_NAME: &str = "brats-seg.toml";
pub const CONFIG_ENV: &str = "BRATS_SEG_CONFIG";
pub const DATA_DIR_ENV: &str = "BRATS_DATA_DIRECTORY";

#[derive(Debug, Clone, PartialEq)]
pub struct DataSection {
    /// Holds the Decathlon task folder and receives every output file.
    pub root: PathBuf,
    pub task: String,
    pub val_frac: f64,
    pub seed: u64,
    pub num_workers: usize,
    /// Workers for the original-spacing evaluation pass.
    pub eval_workers: usize,
    pub download: bool,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            task: "Task01_BrainTumour".to_string(),
            val_frac: 0.2,
            seed: 0,
            num_workers: 2,
            eval_workers: 4,
            download: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSection {
    pub max_epochs: usize,
    pub val_interval: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub amp: bool,
    pub roi_size: [usize; 3],
    pub seed: u64,
    pub metrics_out: Option<PathBuf>,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            max_epochs: 300,
            val_interval: 1,
            lr: 1e-4,
            weight_decay: 1e-5,
            batch_size: 1,
            amp: true,
            roi_size: [224, 224, 144],
            seed: 0,
            metrics_out: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSection {
    pub roi_size: [usize; 3],
    pub overlap: f64,
    pub sw_batch_size: usize,
    pub threshold: f32,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            roi_size: [240, 240, 160],
            overlap: 0.5,
            sw_batch_size: 1,
            threshold: 0.5,
        }
    }
}

/// Everything the train and eval binaries need, before CLI overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub data: DataSection,
    pub train: TrainSection,
    pub model: SegResNetConfig,
    pub inference: InferenceSection,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    data: Option<DataFile>,
    train: Option<TrainFile>,
    model: Option<SegResNetConfig>,
    inference: Option<InferenceFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DataFile {
    root: Option<String>,
    task: Option<String>,
    val_frac: Option<f64>,
    seed: Option<u64>,
    num_workers: Option<usize>,
    eval_workers: Option<usize>,
    download: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TrainFile {
    max_epochs: Option<usize>,
    val_interval: Option<usize>,
    lr: Option<f64>,
    weight_decay: Option<f64>,
    batch_size: Option<usize>,
    amp: Option<bool>,
    roi_size: Option<[usize; 3]>,
    seed: Option<u64>,
    metrics_out: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceFile {
    roi_size: Option<[usize; 3]>,
    overlap: Option<f64>,
    sw_batch_size: Option<usize>,
    threshold: Option<f32>,
}

impl PipelineConfig {
    /// Config file from `explicit`, else `BRATS_SEG_CONFIG`, else
    /// `brats-seg.toml`, with defaults when none exists.
    /// `BRATS_DATA_DIRECTORY` then sets the data root.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => std::env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME)),
        };
        let mut cfg = Self::from_path(&path).unwrap_or_default();
        if let Some(root) = data_dir_from_env() {
            cfg.data.root = root;
        }
        cfg.warn_if_invalid();
        cfg
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), %err, "config unreadable; using defaults");
                return None;
            }
        };
        match toml::from_str::<PipelineConfigFile>(&raw) {
            Ok(file) => Some(Self::from_file(file)),
            Err(err) => {
                warn!(path = %path.display(), %err, "config does not parse; using defaults");
                None
            }
        }
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let data = file.data.unwrap_or_default();
        let train = file.train.unwrap_or_default();
        let inference = file.inference.unwrap_or_default();
        let d = DataSection::default();
        let t = TrainSection::default();
        let i = InferenceSection::default();

        PipelineConfig {
            data: DataSection {
                root: data.root.map(PathBuf::from).unwrap_or(d.root),
                task: data.task.unwrap_or(d.task),
                val_frac: data.val_frac.unwrap_or(d.val_frac),
                seed: data.seed.unwrap_or(d.seed),
                num_workers: data.num_workers.unwrap_or(d.num_workers),
                eval_workers: data.eval_workers.unwrap_or(d.eval_workers),
                download: data.download.unwrap_or(d.download),
            },
            train: TrainSection {
                max_epochs: train.max_epochs.unwrap_or(t.max_epochs),
                val_interval: train.val_interval.unwrap_or(t.val_interval),
                lr: train.lr.unwrap_or(t.lr),
                weight_decay: train.weight_decay.unwrap_or(t.weight_decay),
                batch_size: train.batch_size.unwrap_or(t.batch_size),
                amp: train.amp.unwrap_or(t.amp),
                roi_size: train.roi_size.unwrap_or(t.roi_size),
                seed: train.seed.unwrap_or(t.seed),
                metrics_out: train.metrics_out.map(PathBuf::from),
            },
            model: file.model.unwrap_or_default(),
            inference: InferenceSection {
                roi_size: inference.roi_size.unwrap_or(i.roi_size),
                overlap: inference.overlap.unwrap_or(i.overlap),
                sw_batch_size: inference.sw_batch_size.unwrap_or(i.sw_batch_size),
                threshold: inference.threshold.unwrap_or(i.threshold),
            },
        }
    }

    fn warn_if_invalid(&self) {
        if !(0.0..1.0).contains(&self.data.val_frac) {
            warn!(val_frac = self.data.val_frac, "val_frac outside [0, 1)");
        }
        if self.train.val_interval == 0 {
            warn!("train.val_interval is 0; validation will run every epoch");
        }
        if !(0.0..1.0).contains(&self.inference.overlap) {
            warn!(overlap = self.inference.overlap, "inference.overlap outside [0, 1)");
        }
        let divisor = self.model.required_divisor();
        for roi in [self.train.roi_size, self.inference.roi_size] {
            if roi.iter().any(|s| s % divisor != 0) {
                warn!(?roi, divisor, "roi size not divisible by the network's downsampling factor");
            }
        }
    }
}

/// `BRATS_DATA_DIRECTORY`, with an empty value meaning the working directory.
pub fn data_dir_from_env() -> Option<PathBuf> {
    let raw = std::env::var(DATA_DIR_ENV).ok()?;
    if raw.trim().is_empty() {
        Some(PathBuf::from("."))
    } else {
        Some(PathBuf::from(raw))
    }
}
