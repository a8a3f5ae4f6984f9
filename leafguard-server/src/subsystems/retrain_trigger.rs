//! Retraining trigger - decides when the model gets retrained.
//!
//! Every tick runs two checks in order:
//! 1. Daily gate: a retrain log entry dated today (UTC) ends the tick.
//! 2. Eligibility: count predictions rated `min_stars` in the last
//!    `lookback_days` that carry at least one detection below
//!    `confidence_threshold`. At `min_records` or more, retrain.
//!
//! A successful retrain appends exactly one log entry. A failure anywhere
//! writes nothing, so the next tick evaluates again.
//!
//! The scan is a fresh rescan of the whole window each time. Records already
//! counted by an earlier retrain are counted again until they age out.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use leafguard_core::config::RetrainConfig;
use leafguard_core::{store, Prediction};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};

use super::retrain_executor::RetrainReport;

/// Anything that can run one retraining attempt.
#[async_trait]
pub trait Retrainer: Send + Sync {
    async fn retrain(&self) -> Result<RetrainReport>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    AlreadyRanToday,
    NotEligible { qualifying: usize, required: usize },
    Retrained { qualifying: usize, promoted: bool },
}

/// Records with at least one detection below `threshold`.
pub fn count_qualifying(records: &[Prediction], threshold: f32) -> usize {
    records
        .iter()
        .filter(|p| p.has_low_confidence(threshold))
        .count()
}

pub fn log_details(qualifying: usize, promoted: bool) -> String {
    format!(
        "Retraining with {} records ({})",
        qualifying,
        if promoted { "promoted" } else { "kept current" }
    )
}

/// One trigger evaluation at `now`.
pub async fn evaluate_tick(
    pool: &SqlitePool,
    retrainer: &dyn Retrainer,
    config: &RetrainConfig,
    now: DateTime<Utc>,
) -> Result<TickOutcome> {
    let today = now.date_naive();
    if store::retrain_ran_on(pool, today)
        .await
        .context("checking retrain log")?
    {
        tracing::info!(%today, "Retraining already ran today");
        return Ok(TickOutcome::AlreadyRanToday);
    }

    let since = now - Duration::days(config.lookback_days);
    let records = store::recent_predictions_with_stars(pool, config.min_stars, since)
        .await
        .context("scanning rated predictions")?;
    let qualifying = count_qualifying(&records, config.confidence_threshold);

    if qualifying < config.min_records {
        tracing::info!(
            qualifying,
            required = config.min_records,
            "Retraining conditions not met"
        );
        return Ok(TickOutcome::NotEligible {
            qualifying,
            required: config.min_records,
        });
    }

    tracing::info!(qualifying, "Retraining conditions met, starting retrain");
    let report = retrainer.retrain().await?;

    store::append_retrain_log(
        pool,
        Utc::now(),
        qualifying as i64,
        &log_details(qualifying, report.promoted),
    )
    .await
    .context("writing retrain log")?;

    tracing::info!(qualifying, promoted = report.promoted, "Retraining complete");
    Ok(TickOutcome::Retrained {
        qualifying,
        promoted: report.promoted,
    })
}

/// Called from main.rs to start the background retraining loop.
///
/// `lock` is shared with the manual `/retrain` endpoint so two evaluations
/// never run at once. Errors are logged and the loop waits for the next tick.
pub async fn run_retrain_loop(
    pool: SqlitePool,
    retrainer: Arc<dyn Retrainer>,
    config: RetrainConfig,
    lock: Arc<Mutex<()>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if !config.enabled {
        tracing::info!("Retraining loop disabled via config");
        return;
    }

    let interval = tokio::time::Duration::from_secs(config.interval_hours.max(1) * 3600);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        "Retraining loop started (interval: {}h)",
        config.interval_hours
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _guard = lock.lock().await;
                if let Err(e) = evaluate_tick(&pool, retrainer.as_ref(), &config, Utc::now()).await {
                    tracing::error!("Retraining check failed: {:#}", e);
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Retraining loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use leafguard_core::db::memory_pool;
    use leafguard_core::{Detection, EvalMetrics, NewPrediction};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Mock retrainers
    // ------------------------------------------------------------------

    struct MockRetrainer {
        promoted: bool,
        calls: AtomicUsize,
    }

    impl MockRetrainer {
        fn new(promoted: bool) -> Self {
            Self {
                promoted,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Retrainer for MockRetrainer {
        async fn retrain(&self) -> Result<RetrainReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RetrainReport {
                promoted: self.promoted,
                current: EvalMetrics::default(),
                candidate: EvalMetrics { map50: 0.6, map: 0.4 },
                artifact: PathBuf::from("runs/detect/yolo11n_run/weights/last.pt"),
                run_dir: PathBuf::from("runs/detect/yolo11n_run"),
            })
        }
    }

    struct FailingRetrainer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Retrainer for FailingRetrainer {
        async fn retrain(&self) -> Result<RetrainReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("training process exited with status 1")
        }
    }

    fn detection(confidence: f32) -> Detection {
        Detection {
            x1: 10.0,
            y1: 10.0,
            x2: 50.0,
            y2: 60.0,
            confidence,
            class_name: "Fungi".to_string(),
        }
    }

    async fn rate(pool: &SqlitePool, stars: i64, confidences: &[f32], at: DateTime<Utc>) {
        let prediction = NewPrediction {
            stars,
            detections: confidences.iter().map(|c| detection(*c)).collect(),
            image_source: "upload".to_string(),
        };
        store::insert_prediction(pool, &prediction, at).await.unwrap();
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 14, 12, 0, 0).unwrap()
    }

    // ========================================================================
    // TEST 1: count_qualifying only counts records with a low detection
    // ========================================================================
    #[test]
    fn test_count_qualifying() {
        let make = |confs: &[f32]| Prediction {
            id: 1,
            stars: 1,
            detections: confs.iter().map(|c| detection(*c)).collect(),
            image_source: "x".to_string(),
            created_at: noon(),
        };
        let records = vec![make(&[0.9, 0.5]), make(&[0.51]), make(&[]), make(&[0.2, 0.1])];
        assert_eq!(count_qualifying(&records, 0.51), 2);
    }

    // ========================================================================
    // TEST 2: one qualifying record does not trigger, two do
    // ========================================================================
    #[tokio::test]
    async fn test_eligibility_boundary() {
        let pool = memory_pool().await.unwrap();
        let retrainer = MockRetrainer::new(true);
        let config = RetrainConfig::default();

        rate(&pool, 1, &[0.3], noon() - Duration::days(1)).await;
        let outcome = evaluate_tick(&pool, &retrainer, &config, noon()).await.unwrap();
        assert_eq!(outcome, TickOutcome::NotEligible { qualifying: 1, required: 2 });
        assert_eq!(retrainer.calls.load(Ordering::SeqCst), 0);

        rate(&pool, 1, &[0.9, 0.4], noon() - Duration::hours(2)).await;
        let outcome = evaluate_tick(&pool, &retrainer, &config, noon()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Retrained { qualifying: 2, promoted: true });
        assert_eq!(retrainer.calls.load(Ordering::SeqCst), 1);

        let log = store::list_retrain_log(&pool, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].num_records, 2);
        assert_eq!(log[0].details, "Retraining with 2 records (promoted)");
    }

    // ========================================================================
    // TEST 3: rating, window and confidence filters
    // ========================================================================
    #[tokio::test]
    async fn test_eligibility_filters() {
        let pool = memory_pool().await.unwrap();
        let retrainer = MockRetrainer::new(false);
        let config = RetrainConfig::default();

        rate(&pool, 2, &[0.1], noon() - Duration::hours(1)).await; // not 1 star
        rate(&pool, 1, &[0.1], noon() - Duration::days(7)).await; // outside window
        rate(&pool, 1, &[0.51, 0.8], noon() - Duration::hours(1)).await; // confident
        rate(&pool, 1, &[0.50], noon() - Duration::days(5)).await; // qualifies

        let outcome = evaluate_tick(&pool, &retrainer, &config, noon()).await.unwrap();
        assert_eq!(outcome, TickOutcome::NotEligible { qualifying: 1, required: 2 });
    }

    // ========================================================================
    // TEST 4: daily gate - repeated ticks on the same day retrain once
    // ========================================================================
    #[tokio::test]
    async fn test_daily_gate_idempotent() {
        let pool = memory_pool().await.unwrap();
        let retrainer = MockRetrainer::new(false);
        let config = RetrainConfig::default();
        let now = Utc::now();

        rate(&pool, 1, &[0.2], now - Duration::hours(3)).await;
        rate(&pool, 1, &[0.3], now - Duration::hours(2)).await;

        let first = evaluate_tick(&pool, &retrainer, &config, now).await.unwrap();
        assert!(matches!(first, TickOutcome::Retrained { promoted: false, .. }));

        for _ in 0..5 {
            let outcome = evaluate_tick(&pool, &retrainer, &config, now).await.unwrap();
            assert_eq!(outcome, TickOutcome::AlreadyRanToday);
        }
        assert_eq!(retrainer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store::list_retrain_log(&pool, 10).await.unwrap().len(), 1);
    }

    // ========================================================================
    // TEST 5: a failed retrain writes no log, next tick tries again
    // ========================================================================
    #[tokio::test]
    async fn test_failed_retrain_writes_no_log() {
        let pool = memory_pool().await.unwrap();
        let retrainer = FailingRetrainer {
            calls: AtomicUsize::new(0),
        };
        let config = RetrainConfig::default();

        rate(&pool, 1, &[0.2], noon() - Duration::hours(3)).await;
        rate(&pool, 1, &[0.3], noon() - Duration::hours(2)).await;

        assert!(evaluate_tick(&pool, &retrainer, &config, noon()).await.is_err());
        assert!(store::list_retrain_log(&pool, 10).await.unwrap().is_empty());

        assert!(evaluate_tick(&pool, &retrainer, &config, noon()).await.is_err());
        assert_eq!(retrainer.calls.load(Ordering::SeqCst), 2);
    }

    // ========================================================================
    // TEST 6: a log entry from yesterday does not block today
    // ========================================================================
    #[tokio::test]
    async fn test_gate_only_blocks_same_day() {
        let pool = memory_pool().await.unwrap();
        let retrainer = MockRetrainer::new(true);
        let config = RetrainConfig::default();

        store::append_retrain_log(&pool, noon() - Duration::days(1), 3, "earlier")
            .await
            .unwrap();
        rate(&pool, 1, &[0.2], noon() - Duration::hours(3)).await;
        rate(&pool, 1, &[0.3], noon() - Duration::hours(2)).await;

        let outcome = evaluate_tick(&pool, &retrainer, &config, noon()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Retrained { qualifying: 2, .. }));
    }

    // ========================================================================
    // TEST 7: loop exits on shutdown
    // ========================================================================
    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let pool = memory_pool().await.unwrap();
        let retrainer: Arc<dyn Retrainer> = Arc::new(MockRetrainer::new(false));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(run_retrain_loop(
            pool,
            retrainer,
            RetrainConfig::default(),
            Arc::new(Mutex::new(())),
            rx,
        ));
        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
