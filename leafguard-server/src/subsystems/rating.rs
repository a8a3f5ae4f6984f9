//! Rating subsystem - validates a rating submission and appends it to the
//! prediction store.

use anyhow::Result;
use chrono::Utc;
use leafguard_core::{store, Detection, LeafguardError, NewPrediction};
use serde::Deserialize;
use sqlx::SqlitePool;

/// Body of `POST /save_rating`. Every field is required; they are optional
/// here so a missing field becomes a 400 instead of an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct SaveRatingRequest {
    pub stars: Option<i64>,
    pub detections: Option<Vec<Detection>>,
    pub image_source: Option<String>,
}

impl SaveRatingRequest {
    pub fn into_new_prediction(self) -> Result<NewPrediction, LeafguardError> {
        let mut missing = Vec::new();
        if self.stars.is_none() {
            missing.push("stars");
        }
        if self.detections.is_none() {
            missing.push("detections");
        }
        if self.image_source.is_none() {
            missing.push("image_source");
        }
        let (Some(stars), Some(detections), Some(image_source)) =
            (self.stars, self.detections, self.image_source)
        else {
            return Err(LeafguardError::Validation(format!(
                "missing fields: {}",
                missing.join(", ")
            )));
        };

        let prediction = NewPrediction {
            stars,
            detections,
            image_source,
        };
        prediction.validate().map_err(LeafguardError::Validation)?;
        Ok(prediction)
    }
}

/// Store a validated rating. Returns the new prediction id.
pub async fn save_rating(pool: &SqlitePool, prediction: &NewPrediction) -> Result<i64> {
    let id = store::insert_prediction(pool, prediction, Utc::now()).await?;
    tracing::info!(
        id,
        stars = prediction.stars,
        detections = prediction.detections.len(),
        "Rating saved"
    );
    Ok(id)
}
