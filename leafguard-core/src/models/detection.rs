use serde::{Deserialize, Serialize};

/// One box produced by the detector, in absolute pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_name: String,
}

impl Detection {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            ));
        }
        if ![self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite()) {
            return Err("box coordinates must be finite".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_name: "Fungi".to_string(),
        }
    }

    #[test]
    fn test_serializes_class_key() {
        let json = serde_json::to_value(det(0.0, 0.0, 10.0, 10.0, 0.9)).unwrap();
        assert_eq!(json["class"], "Fungi");
        assert!(json.get("class_name").is_none());
    }

    #[test]
    fn test_missing_field_rejected() {
        let raw = r#"{"x1": 1, "y1": 2, "x2": 3, "y2": 4, "class": "Sano"}"#;
        assert!(serde_json::from_str::<Detection>(raw).is_err());
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = det(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = det(20.0, 20.0, 30.0, 30.0, 0.9);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = det(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = det(5.0, 0.0, 15.0, 10.0, 0.9);
        // inter 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_confidence_range() {
        assert!(det(0.0, 0.0, 1.0, 1.0, 0.5).validate().is_ok());
        assert!(det(0.0, 0.0, 1.0, 1.0, 1.5).validate().is_err());
        assert!(det(f32::NAN, 0.0, 1.0, 1.0, 0.5).validate().is_err());
    }
}
