use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Detection;

pub const MIN_STARS: i64 = 1;
pub const MAX_STARS: i64 = 5;

/// A rated inference as stored in the predictions table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub stars: i64,
    pub detections: Vec<Detection>,
    pub image_source: String,
    pub created_at: DateTime<Utc>,
}

/// A rating submission, validated before it reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrediction {
    pub stars: i64,
    pub detections: Vec<Detection>,
    pub image_source: String,
}

impl NewPrediction {
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_STARS..=MAX_STARS).contains(&self.stars) {
            return Err(format!(
                "stars must be between {} and {}, got {}",
                MIN_STARS, MAX_STARS, self.stars
            ));
        }
        if self.image_source.trim().is_empty() {
            return Err("image_source must not be empty".to_string());
        }
        for (i, d) in self.detections.iter().enumerate() {
            d.validate().map_err(|e| format!("detection {}: {}", i, e))?;
        }
        Ok(())
    }
}

impl Prediction {
    /// True when any detection falls below `threshold`.
    pub fn has_low_confidence(&self, threshold: f32) -> bool {
        self.detections.iter().any(|d| d.confidence < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(stars: i64, source: &str) -> NewPrediction {
        NewPrediction {
            stars,
            detections: vec![],
            image_source: source.to_string(),
        }
    }

    #[test]
    fn test_validate_star_bounds() {
        assert!(rating(1, "upload").validate().is_ok());
        assert!(rating(5, "upload").validate().is_ok());
        assert!(rating(0, "upload").validate().is_err());
        assert!(rating(6, "upload").validate().is_err());
    }

    #[test]
    fn test_validate_empty_source() {
        assert!(rating(3, "  ").validate().is_err());
    }

    fn stored(confidences: &[f32]) -> Prediction {
        Prediction {
            id: 1,
            stars: 1,
            detections: confidences
                .iter()
                .map(|&confidence| Detection {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 10.0,
                    y2: 10.0,
                    confidence,
                    class_name: "Fungi".to_string(),
                })
                .collect(),
            image_source: "camera".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_detections_never_low_confidence() {
        assert!(!stored(&[]).has_low_confidence(0.51));
    }

    #[test]
    fn test_low_confidence_is_strictly_below() {
        assert!(stored(&[0.9, 0.505]).has_low_confidence(0.51));
        assert!(!stored(&[0.51, 0.9]).has_low_confidence(0.51));
    }
}
