pub mod detection;
pub mod prediction;
pub mod retrain_log;

pub use detection::Detection;
pub use prediction::{NewPrediction, Prediction, MAX_STARS, MIN_STARS};
pub use retrain_log::RetrainLogEntry;
