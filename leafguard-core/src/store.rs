//! Prediction Store and Retrain Log.
//!
//! Both tables are append-only from the service's point of view. Every
//! function here is a single statement; callers never hold a transaction
//! across calls.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::error::LeafguardError;
use crate::models::{Detection, NewPrediction, Prediction, RetrainLogEntry};

#[derive(sqlx::FromRow)]
struct PredictionRow {
    id: i64,
    stars: i64,
    detections: String,
    image_source: String,
    created_at: DateTime<Utc>,
}

impl PredictionRow {
    fn into_prediction(self) -> Result<Prediction, serde_json::Error> {
        let detections: Vec<Detection> = serde_json::from_str(&self.detections)?;
        Ok(Prediction {
            id: self.id,
            stars: self.stars,
            detections,
            image_source: self.image_source,
            created_at: self.created_at,
        })
    }
}

/// Persist one rating. Returns the new row id.
pub async fn insert_prediction(
    pool: &SqlitePool,
    prediction: &NewPrediction,
    created_at: DateTime<Utc>,
) -> Result<i64, LeafguardError> {
    let detections = serde_json::to_string(&prediction.detections)?;
    let result = sqlx::query(
        "INSERT INTO predictions (stars, detections, image_source, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(prediction.stars)
    .bind(detections)
    .bind(&prediction.image_source)
    .bind(created_at)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get_prediction(
    pool: &SqlitePool,
    id: i64,
) -> Result<Option<Prediction>, LeafguardError> {
    let row: Option<PredictionRow> = sqlx::query_as(
        "SELECT id, stars, detections, image_source, created_at FROM predictions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(Some(r.into_prediction()?)),
        None => Ok(None),
    }
}

/// Predictions rated exactly `stars` and created at or after `since`.
///
/// Rows whose stored detections no longer deserialize are skipped.
pub async fn recent_predictions_with_stars(
    pool: &SqlitePool,
    stars: i64,
    since: DateTime<Utc>,
) -> Result<Vec<Prediction>, LeafguardError> {
    let rows: Vec<PredictionRow> = sqlx::query_as(
        r#"
        SELECT id, stars, detections, image_source, created_at
        FROM predictions
        WHERE stars = $1 AND created_at >= $2
        ORDER BY id
        "#,
    )
    .bind(stars)
    .bind(since)
    .fetch_all(pool)
    .await?;

    let mut predictions = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id;
        match row.into_prediction() {
            Ok(p) => predictions.push(p),
            Err(e) => tracing::warn!(id, error = %e, "Skipping prediction with unreadable detections"),
        }
    }
    Ok(predictions)
}

pub async fn count_retrains_between(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<i64, LeafguardError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM retrain_log WHERE executed_at >= $1 AND executed_at < $2",
    )
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Whether a retrain log entry exists for the given UTC calendar date.
pub async fn retrain_ran_on(pool: &SqlitePool, date: NaiveDate) -> Result<bool, LeafguardError> {
    let start = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| LeafguardError::Other(format!("invalid date {}", date)))?
        .and_utc();
    let end = start + Duration::days(1);
    Ok(count_retrains_between(pool, start, end).await? > 0)
}

pub async fn append_retrain_log(
    pool: &SqlitePool,
    executed_at: DateTime<Utc>,
    num_records: i64,
    details: &str,
) -> Result<i64, LeafguardError> {
    let result = sqlx::query(
        "INSERT INTO retrain_log (executed_at, num_records, details) VALUES ($1, $2, $3)",
    )
    .bind(executed_at)
    .bind(num_records)
    .bind(details)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Most recent retrain log entries first.
pub async fn list_retrain_log(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<RetrainLogEntry>, LeafguardError> {
    let rows = sqlx::query_as::<_, RetrainLogEntry>(
        "SELECT id, executed_at, num_records, details FROM retrain_log ORDER BY executed_at DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
