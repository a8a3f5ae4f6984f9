use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetrainLogEntry {
    pub id: i64,
    pub executed_at: DateTime<Utc>,
    pub num_records: i64,
    pub details: String,
}
