pub mod predict;
pub mod rating;
pub mod retrain_executor;
pub mod retrain_trigger;
