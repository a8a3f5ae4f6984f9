pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod models;
pub mod onnx_detector;
pub mod store;
pub mod training;
pub mod ultralytics;

pub use config::LeafguardConfig;
pub use detector::{Detector, DetectorError};
pub use error::LeafguardError;
pub use models::{Detection, NewPrediction, Prediction, RetrainLogEntry};
pub use onnx_detector::OnnxDetector;
pub use training::{EvalMetrics, TrainOutcome, TrainRequest, TrainingBackend, TrainingError};
pub use ultralytics::UltralyticsBackend;
