#![recursion_limit = "256"]

pub mod amp;
pub mod config;
pub mod history;
pub mod inferer;
pub mod loss;
pub mod metrics;
pub mod pipeline;
pub mod plot;

pub use amp::LossScaler;
pub use config::PipelineConfig;
pub use history::{BestMetricTracker, EpochAccumulator, MetricsLog, TrainingHistory};
pub use inferer::{sliding_window_inference, SlidingWindow};
pub use loss::DiceLoss;
pub use metrics::{DiceMetric, MetricReduction};
pub use models::{SegResNet, SegResNetConfig};
pub use pipeline::{run_eval, run_train, EvalArgs, RegionScores, TrainArgs};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
