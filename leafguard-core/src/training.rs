//! Training backend seam - train, evaluate and export detection models.
//!
//! The retraining executor only talks to [`TrainingBackend`]; results come
//! back as typed values instead of process exit codes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One training invocation.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// Weights to start from (the current production model, if any).
    pub base_model: Option<PathBuf>,
    pub data_config: PathBuf,
    pub epochs: u32,
    pub imgsz: u32,
    pub batch: u32,
    pub patience: u32,
    /// Run directory name prefix, e.g. `yolo11n_run`.
    pub run_name: String,
    pub runs_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct TrainOutcome {
    /// Run directory reported by the backend, when it knows it.
    pub run_dir: Option<PathBuf>,
}

/// Detection quality on one dataset split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// mAP at IoU 0.5.
    pub map50: f64,
    /// mAP averaged over IoU 0.5:0.95.
    pub map: f64,
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    async fn train(&self, request: &TrainRequest) -> Result<TrainOutcome, TrainingError>;

    async fn evaluate(
        &self,
        model: &Path,
        data_config: &Path,
        split: &str,
    ) -> Result<EvalMetrics, TrainingError>;

    /// Export `model` to ONNX for the detector. Returns the exported file.
    async fn export_onnx(&self, model: &Path) -> Result<PathBuf, TrainingError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Failed to launch training process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Training process failed ({status}): {stderr}")]
    ProcessFailed { status: String, stderr: String },

    #[error("Training process timed out after {minutes} minutes")]
    Timeout { minutes: u64 },

    #[error("Could not parse backend output: {0}")]
    InvalidOutput(String),
}
