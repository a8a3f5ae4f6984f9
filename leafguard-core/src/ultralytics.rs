//! Ultralytics training backend.
//!
//! Drives the Ultralytics Python API in a child process. Arguments travel
//! through `sys.argv` and every script ends by printing a single
//! `LEAFGUARD_RESULT <json>` line, which is the only thing read back.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::TrainingConfig;
use crate::training::{EvalMetrics, TrainOutcome, TrainRequest, TrainingBackend, TrainingError};

const RESULT_MARKER: &str = "LEAFGUARD_RESULT ";
const STDERR_TAIL: usize = 2000;

const TRAIN_SCRIPT: &str = r#"
import json, sys
from ultralytics import YOLO
base, data, epochs, imgsz, batch, patience, name, project = sys.argv[1:9]
model = YOLO(base if base else "yolo11n.pt")
results = model.train(data=data, epochs=int(epochs), imgsz=int(imgsz), batch=int(batch),
                      name=name, patience=int(patience), project=project)
save_dir = getattr(results, "save_dir", None) or getattr(getattr(model, "trainer", None), "save_dir", None)
print("LEAFGUARD_RESULT " + json.dumps({"run_dir": str(save_dir) if save_dir else None}))
"#;

const EVAL_SCRIPT: &str = r#"
import json, sys
from ultralytics import YOLO
model, data, split = sys.argv[1:4]
r = YOLO(model).val(data=data, split=split)
print("LEAFGUARD_RESULT " + json.dumps({"map50": float(r.box.map50), "map": float(r.box.map)}))
"#;

const EXPORT_SCRIPT: &str = r#"
import json, sys
from ultralytics import YOLO
path = YOLO(sys.argv[1]).export(format="onnx")
print("LEAFGUARD_RESULT " + json.dumps({"path": str(path)}))
"#;

#[derive(Debug, Clone)]
pub struct UltralyticsBackend {
    python: String,
    timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct TrainResult {
    run_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct ExportResult {
    path: PathBuf,
}

impl UltralyticsBackend {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            python: config.python.clone(),
            timeout: config
                .timeout_minutes
                .map(|m| Duration::from_secs(m * 60)),
        }
    }

    async fn run_script<T: DeserializeOwned>(
        &self,
        script: &str,
        args: &[String],
    ) -> Result<T, TrainingError> {
        let child = Command::new(&self.python)
            .arg("-c")
            .arg(script)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| TrainingError::Timeout {
                    minutes: limit.as_secs() / 60,
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TrainingError::ProcessFailed {
                status: output.status.to_string(),
                stderr: tail(&stderr, STDERR_TAIL).to_string(),
            });
        }

        parse_result(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl TrainingBackend for UltralyticsBackend {
    async fn train(&self, request: &TrainRequest) -> Result<TrainOutcome, TrainingError> {
        let base = request
            .base_model
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let args = vec![
            base,
            request.data_config.display().to_string(),
            request.epochs.to_string(),
            request.imgsz.to_string(),
            request.batch.to_string(),
            request.patience.to_string(),
            request.run_name.clone(),
            request.runs_dir.display().to_string(),
        ];

        tracing::info!(
            run_name = %request.run_name,
            epochs = request.epochs,
            "Starting Ultralytics training"
        );
        let result: TrainResult = self.run_script(TRAIN_SCRIPT, &args).await?;
        Ok(TrainOutcome {
            run_dir: result.run_dir,
        })
    }

    async fn evaluate(
        &self,
        model: &Path,
        data_config: &Path,
        split: &str,
    ) -> Result<EvalMetrics, TrainingError> {
        let args = vec![
            model.display().to_string(),
            data_config.display().to_string(),
            split.to_string(),
        ];
        self.run_script(EVAL_SCRIPT, &args).await
    }

    async fn export_onnx(&self, model: &Path) -> Result<PathBuf, TrainingError> {
        let result: ExportResult = self
            .run_script(EXPORT_SCRIPT, &[model.display().to_string()])
            .await?;
        Ok(result.path)
    }

    fn name(&self) -> &str {
        "ultralytics"
    }
}

/// Pull the last `LEAFGUARD_RESULT` line out of the script's stdout.
fn parse_result<T: DeserializeOwned>(stdout: &str) -> Result<T, TrainingError> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix(RESULT_MARKER))
        .ok_or_else(|| TrainingError::InvalidOutput("no result line in output".to_string()))?;
    serde_json::from_str(line).map_err(|e| TrainingError::InvalidOutput(e.to_string()))
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_takes_last_marker_line() {
        let stdout = "Ultralytics 8.3\nLEAFGUARD_RESULT {\"map50\": 0.1, \"map\": 0.05}\nepoch noise\nLEAFGUARD_RESULT {\"map50\": 0.65, \"map\": 0.5}\n";
        let metrics: EvalMetrics = parse_result(stdout).unwrap();
        assert!((metrics.map50 - 0.65).abs() < 1e-9);
        assert!((metrics.map - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_result_missing_marker() {
        let result: Result<EvalMetrics, _> = parse_result("nothing useful\n");
        assert!(matches!(result, Err(TrainingError::InvalidOutput(_))));
    }

    #[test]
    fn test_parse_train_result_null_run_dir() {
        let result: TrainResult = parse_result("LEAFGUARD_RESULT {\"run_dir\": null}").unwrap();
        assert!(result.run_dir.is_none());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(t.len() <= 3);
        assert!(s.ends_with(t));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let backend = UltralyticsBackend {
            python: "/nonexistent/python-leafguard".to_string(),
            timeout: None,
        };
        let err = backend
            .export_onnx(Path::new("model.pt"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::Spawn(_)));
    }
}
