//! Prediction subsystem - base64 image in, filtered detections out.

use base64::Engine;
use image::DynamicImage;
use leafguard_core::{Detection, Detector, DetectorError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("No image provided")]
    MissingImage,

    #[error("Invalid base64 image data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Could not decode image: {0}")]
    InvalidImage(#[from] image::ImageError),

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl PredictError {
    /// Errors caused by the request body rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PredictError::MissingImage | PredictError::InvalidBase64(_) | PredictError::InvalidImage(_)
        )
    }
}

/// Decode raw base64 or a `data:<mime>;base64,<payload>` URL into an RGB image.
pub fn decode_image_payload(payload: &str) -> Result<DynamicImage, PredictError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(PredictError::MissingImage);
    }
    let encoded = match payload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => payload,
    };
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let image = image::load_from_memory(&bytes)?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Drop detections below `threshold`.
pub fn filter_confident(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= threshold)
        .collect()
}

pub async fn predict(
    detector: &dyn Detector,
    payload: &str,
    threshold: f32,
) -> Result<Vec<Detection>, PredictError> {
    let image = decode_image_payload(payload)?;
    let detections = detector.detect(&image).await?;
    let kept = filter_confident(detections, threshold);
    tracing::debug!(
        detector = detector.name(),
        width = image.width(),
        height = image.height(),
        detections = kept.len(),
        "Prediction complete"
    );
    Ok(kept)
}
