//! Detector seam - the object-detection model behind `/predict`.
//!
//! The model is opaque to the rest of the service: image in, list of
//! [`Detection`] out. [`crate::onnx_detector::OnnxDetector`] is the production
//! implementation; tests substitute their own.

use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

use crate::models::Detection;

#[async_trait]
pub trait Detector: Send + Sync {
    /// Run the model on a decoded image. Coordinates are absolute pixels of
    /// the input image.
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Detector model not found at {path}")]
    ModelNotFound { path: String },

    #[error("ONNX inference error: {0}")]
    OnnxInference(String),

    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),
}
