//! Retraining executor: train, evaluate, promote.
//!
//! One run:
//! 1. Train from the current model (or the backend's base weights).
//! 2. Locate the run directory and require `weights/last.pt` inside it.
//! 3. Evaluate current and candidate on the same held-out split; a missing
//!    current model scores zero.
//! 4. Promote when [`should_promote`] says so: drop the old deprecated slot,
//!    move current to deprecated, copy the candidate into current.
//! 5. Delete the run directory, whatever happened in 2 to 4.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use leafguard_core::config::{expand_path, TrainingConfig};
use leafguard_core::{EvalMetrics, TrainRequest, TrainingBackend};
use serde::Serialize;
use thiserror::Error;

use super::retrain_trigger::Retrainer;

#[derive(Debug, Clone, Serialize)]
pub struct RetrainReport {
    pub promoted: bool,
    pub current: EvalMetrics,
    pub candidate: EvalMetrics,
    pub artifact: PathBuf,
    pub run_dir: PathBuf,
}

#[derive(Error, Debug)]
pub enum RetrainError {
    #[error("No run directory starting with '{prefix}' under {runs_dir}")]
    NoRunDirectory { runs_dir: PathBuf, prefix: String },

    #[error("Trained model not found at {path}")]
    ArtifactMissing { path: PathBuf },
}

/// Adopt the candidate if its mAP@0.5:0.95 is strictly higher, or if the two
/// are within `epsilon` and its mAP@0.5 is strictly higher.
pub fn should_promote(current: EvalMetrics, candidate: EvalMetrics, epsilon: f64) -> bool {
    candidate.map > current.map
        || ((candidate.map - current.map).abs() < epsilon && candidate.map50 > current.map50)
}

/// Most recently modified directory under `runs_dir` whose name starts with
/// `prefix`. A missing `runs_dir` yields `None`.
pub fn latest_run_dir(runs_dir: &Path, prefix: &str) -> std::io::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(runs_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let matches = path.is_dir()
            && entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(prefix))
                .unwrap_or(false);
        if !matches {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if latest.as_ref().map(|(t, _)| modified >= *t).unwrap_or(true) {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, p)| p))
}

/// Move `current` to `deprecated` and copy `artifact` into `current`.
///
/// If the copy fails after the rename, the deprecated file is moved back so the
/// current slot is never left empty.
pub fn promote_artifact(artifact: &Path, current: &Path, deprecated: &Path) -> Result<()> {
    if let Some(parent) = current.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating model directory {}", parent.display()))?;
    }

    if deprecated.exists() {
        std::fs::remove_file(deprecated)
            .with_context(|| format!("removing {}", deprecated.display()))?;
    }

    let had_current = current.exists();
    if had_current {
        std::fs::rename(current, deprecated).with_context(|| {
            format!("moving {} to {}", current.display(), deprecated.display())
        })?;
    }

    if let Err(e) = std::fs::copy(artifact, current) {
        if had_current {
            if let Err(restore) = std::fs::rename(deprecated, current) {
                tracing::error!(
                    "Failed to restore {} after aborted promotion: {}",
                    current.display(),
                    restore
                );
            }
        }
        return Err(e).with_context(|| {
            format!("copying {} to {}", artifact.display(), current.display())
        });
    }

    Ok(())
}

pub struct RetrainExecutor {
    backend: Arc<dyn TrainingBackend>,
    config: TrainingConfig,
}

impl RetrainExecutor {
    pub fn new(backend: Arc<dyn TrainingBackend>, config: TrainingConfig) -> Self {
        Self { backend, config }
    }

    fn current_model(&self) -> PathBuf {
        expand_path(&self.config.current_model)
    }

    fn deprecated_model(&self) -> PathBuf {
        expand_path(&self.config.deprecated_model)
    }

    fn data_config(&self) -> PathBuf {
        expand_path(&self.config.data_config)
    }

    pub async fn execute(&self) -> Result<RetrainReport> {
        let current = self.current_model();
        let runs_dir = expand_path(&self.config.runs_dir);

        let request = TrainRequest {
            base_model: current.exists().then(|| current.clone()),
            data_config: self.data_config(),
            epochs: self.config.epochs,
            imgsz: self.config.imgsz,
            batch: self.config.batch,
            patience: self.config.patience,
            run_name: self.config.run_name.clone(),
            runs_dir: runs_dir.clone(),
        };

        tracing::info!(backend = self.backend.name(), "Training candidate model");
        let outcome = self.backend.train(&request).await.context("training failed")?;

        let run_dir = match outcome.run_dir.filter(|d| d.is_dir()) {
            Some(dir) => dir,
            None => latest_run_dir(&runs_dir, &self.config.run_name)
                .with_context(|| format!("scanning {}", runs_dir.display()))?
                .ok_or_else(|| RetrainError::NoRunDirectory {
                    runs_dir: runs_dir.clone(),
                    prefix: self.config.run_name.clone(),
                })?,
        };
        tracing::info!(run_dir = %run_dir.display(), "Located training run");

        let result = self.evaluate_and_promote(&run_dir).await;

        match tokio::fs::remove_dir_all(&run_dir).await {
            Ok(()) => tracing::info!(run_dir = %run_dir.display(), "Removed training run directory"),
            Err(e) => tracing::warn!(run_dir = %run_dir.display(), "Failed to remove run directory: {}", e),
        }

        result
    }

    async fn evaluate_and_promote(&self, run_dir: &Path) -> Result<RetrainReport> {
        let artifact = run_dir.join(&self.config.weights_file);
        if !artifact.is_file() {
            tracing::error!(path = %artifact.display(), "Trained model not found, not updating");
            return Err(RetrainError::ArtifactMissing { path: artifact }.into());
        }

        let current = self.current_model();
        let data_config = self.data_config();
        let split = self.config.eval_split.as_str();

        let current_metrics = if current.is_file() {
            self.backend
                .evaluate(&current, &data_config, split)
                .await
                .context("evaluating current model")?
        } else {
            tracing::info!("No current model, assuming zero mAP");
            EvalMetrics::default()
        };
        let candidate_metrics = self
            .backend
            .evaluate(&artifact, &data_config, split)
            .await
            .context("evaluating candidate model")?;

        tracing::info!(
            current_map50 = current_metrics.map50,
            current_map = current_metrics.map,
            candidate_map50 = candidate_metrics.map50,
            candidate_map = candidate_metrics.map,
            "Evaluated models on {} split",
            split
        );

        let promoted = should_promote(current_metrics, candidate_metrics, self.config.promotion_epsilon);
        if promoted {
            promote_artifact(&artifact, &current, &self.deprecated_model())?;
            tracing::info!(model = %current.display(), "Candidate promoted");

            if self.config.export_onnx {
                match self.backend.export_onnx(&current).await {
                    Ok(path) => tracing::info!(path = %path.display(), "Exported promoted model to ONNX"),
                    Err(e) => tracing::warn!("ONNX export failed, detector keeps previous export: {}", e),
                }
            }
        } else {
            tracing::info!("Candidate does not improve on current model, keeping current");
        }

        Ok(RetrainReport {
            promoted,
            current: current_metrics,
            candidate: candidate_metrics,
            artifact,
            run_dir: run_dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl Retrainer for RetrainExecutor {
    async fn retrain(&self) -> Result<RetrainReport> {
        self.execute().await
    }
}
