//! Leafguard HTTP API
//!
//! Axum server exposing inference, rating submission and the retraining
//! controls.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a pure
//! inner function returning `(StatusCode, serde_json::Value)`. The inner
//! functions are directly testable without axum dispatch machinery.
//!
//! Endpoints:
//! - GET  /health       - health check with DB status
//! - GET  /version      - server version info
//! - POST /predict      - detect disease regions in a base64 image
//! - POST /save_rating  - store a rated prediction
//! - POST /retrain      - run one retraining check now
//! - GET  /retrain_log  - recent retraining executions

use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use leafguard_core::{store, Detector, LeafguardConfig};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};

use crate::subsystems::predict;
use crate::subsystems::rating::{self, SaveRatingRequest};
use crate::subsystems::retrain_trigger::{self, Retrainer};

const DEFAULT_LOG_LIMIT: i64 = 20;
const MAX_LOG_LIMIT: i64 = 500;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: SqlitePool,
    pub config: LeafguardConfig,
    /// `None` when the model could not be loaded at startup.
    pub detector: Option<Arc<dyn Detector>>,
    pub retrainer: Arc<dyn Retrainer>,
    /// Held while a retraining check runs, shared with the background loop.
    pub retrain_lock: Arc<Mutex<()>>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let body_limit = state.config.http.max_body_bytes();
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/predict", post(predict_handler))
        .route("/save_rating", post(save_rating_handler))
        .route("/retrain", post(retrain_handler))
        .route("/retrain_log", get(retrain_log_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Leafguard HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct PredictRequest {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RetrainLogQuery {
    pub limit: Option<i64>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

fn error_body(status: StatusCode, msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    let body = serde_json::to_value(ErrorResponse::new(msg))
        .unwrap_or_else(|_| serde_json::json!({"status": "error"}));
    (status, body)
}

/// Structured body for a request the JSON extractor refused. Oversized bodies
/// keep their 413; everything else is a 400.
pub fn rejection_body(rejection: JsonRejection) -> (StatusCode, serde_json::Value) {
    let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        StatusCode::BAD_REQUEST
    };
    tracing::debug!(%status, "Rejected request body: {}", rejection.body_text());
    error_body(status, rejection.body_text())
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check - queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &SqlitePool, detector_loaded: bool) -> (StatusCode, serde_json::Value) {
    match leafguard_core::db::health_check(pool).await {
        Ok(version) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "sqlite": version,
                "detector": detector_loaded,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version - returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "service": "leafguard",
    })
}

/// Inner predict - decodes the image and runs the detector.
pub async fn predict_inner(
    detector: Option<&dyn Detector>,
    threshold: f32,
    req: PredictRequest,
) -> (StatusCode, serde_json::Value) {
    let image = match req.image {
        Some(img) if !img.trim().is_empty() => img,
        _ => return error_body(StatusCode::BAD_REQUEST, "No image provided"),
    };

    let Some(detector) = detector else {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "Detection model not loaded");
    };

    match predict::predict(detector, &image, threshold).await {
        Ok(detections) => (
            StatusCode::OK,
            serde_json::json!({ "detections": detections }),
        ),
        Err(e) if e.is_client_error() => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            tracing::error!("Detector failure: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Inner save_rating - validates and stores a rating.
pub async fn save_rating_inner(
    pool: &SqlitePool,
    req: SaveRatingRequest,
) -> (StatusCode, serde_json::Value) {
    let prediction = match req.into_new_prediction() {
        Ok(p) => p,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match rating::save_rating(pool, &prediction).await {
        Ok(id) => (
            StatusCode::OK,
            serde_json::json!({
                "message": "Rating saved",
                "id": id,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to save rating: {:#}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Inner retrain - runs one trigger evaluation unless one is already running.
pub async fn retrain_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    let Ok(_guard) = state.retrain_lock.try_lock() else {
        return error_body(StatusCode::CONFLICT, "Retraining already in progress");
    };

    tracing::info!("Manual retraining check requested");
    match retrain_trigger::evaluate_tick(
        &state.pool,
        state.retrainer.as_ref(),
        &state.config.retrain,
        Utc::now(),
    )
    .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            serde_json::to_value(&outcome).unwrap_or_else(|_| serde_json::json!({})),
        ),
        Err(e) => {
            tracing::error!("Manual retraining failed: {:#}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

/// Inner retrain_log - newest entries first.
pub async fn retrain_log_inner(
    pool: &SqlitePool,
    query: RetrainLogQuery,
) -> (StatusCode, serde_json::Value) {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match store::list_retrain_log(pool, limit).await {
        Ok(entries) => (
            StatusCode::OK,
            serde_json::json!({
                "count": entries.len(),
                "entries": entries,
            }),
        ),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Axum handler wrappers (thin - delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool, state.detector.is_some()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn predict_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let (status, body) = rejection_body(rejection);
            return (status, Json(body));
        }
    };
    let (status, body) = predict_inner(
        state.detector.as_deref(),
        state.config.detector.confidence_threshold,
        req,
    )
    .await;
    (status, Json(body))
}

pub async fn save_rating_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<SaveRatingRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match payload {
        Ok(Json(req)) => save_rating_inner(&state.pool, req).await,
        Err(rejection) => rejection_body(rejection),
    };
    (status, Json(body))
}

pub async fn retrain_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = retrain_inner(&state).await;
    (status, Json(body))
}

pub async fn retrain_log_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<RetrainLogQuery>,
) -> impl IntoResponse {
    let (status, body) = retrain_log_inner(&state.pool, query).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests - call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::retrain_executor::RetrainReport;
    use async_trait::async_trait;
    use base64::Engine;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use leafguard_core::config::DatabaseConfig;
    use leafguard_core::db::memory_pool;
    use leafguard_core::{Detection, DetectorError, EvalMetrics};
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockDetector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Detector for MockDetector {
        async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let w = image.width() as f32;
            Ok(vec![
                Detection {
                    x1: 0.0,
                    y1: 0.0,
                    x2: w,
                    y2: 2.0,
                    confidence: 0.87,
                    class_name: "Phytophthora".to_string(),
                },
                Detection {
                    x1: 1.0,
                    y1: 1.0,
                    x2: 2.0,
                    y2: 2.0,
                    confidence: 0.2,
                    class_name: "Fungi".to_string(),
                },
            ])
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    struct BrokenDetector;

    #[async_trait]
    impl Detector for BrokenDetector {
        async fn detect(&self, _image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
            Err(DetectorError::OnnxInference("session poisoned".to_string()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    struct NoopRetrainer;

    #[async_trait]
    impl Retrainer for NoopRetrainer {
        async fn retrain(&self) -> anyhow::Result<RetrainReport> {
            Ok(RetrainReport {
                promoted: false,
                current: EvalMetrics::default(),
                candidate: EvalMetrics::default(),
                artifact: PathBuf::new(),
                run_dir: PathBuf::new(),
            })
        }
    }

    fn jpeg_data_url() -> String {
        let img = RgbImage::from_pixel(16, 16, Rgb([40, 140, 60]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
        format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
        )
    }

    async fn make_state() -> HttpState {
        let pool = memory_pool().await.unwrap();
        HttpState {
            pool,
            config: LeafguardConfig::with_database(DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
            }),
            detector: None,
            retrainer: Arc::new(NoopRetrainer),
            retrain_lock: Arc::new(Mutex::new(())),
        }
    }

    // ========================================================================
    // TEST 1: version_inner is pure and returns correct fields
    // ========================================================================
    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["service"], "leafguard");
    }

    // ========================================================================
    // TEST 2: health_inner - in-memory DB is healthy
    // ========================================================================
    #[tokio::test]
    async fn test_health_inner_ok() {
        let state = make_state().await;
        let (status, body) = health_inner(&state.pool, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["sqlite"].is_string());
        assert_eq!(body["detector"], false);
    }

    // ========================================================================
    // TEST 3: predict_inner - missing image is 400
    // ========================================================================
    #[tokio::test]
    async fn test_predict_inner_missing_image() {
        let detector = MockDetector { calls: AtomicUsize::new(0) };
        let (status, body) = predict_inner(Some(&detector), 0.5, PredictRequest::default()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    }

    // ========================================================================
    // TEST 4: predict_inner - no model loaded is 503
    // ========================================================================
    #[tokio::test]
    async fn test_predict_inner_no_detector() {
        let req = PredictRequest { image: Some(jpeg_data_url()) };
        let (status, _) = predict_inner(None, 0.5, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    // ========================================================================
    // TEST 5: predict_inner - drops detections under threshold
    // ========================================================================
    #[tokio::test]
    async fn test_predict_inner_filters() {
        let detector = MockDetector { calls: AtomicUsize::new(0) };
        let req = PredictRequest { image: Some(jpeg_data_url()) };
        let (status, body) = predict_inner(Some(&detector), 0.5, req).await;

        assert_eq!(status, StatusCode::OK, "{body}");
        let detections = body["detections"].as_array().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0]["class"], "Phytophthora");
        assert_eq!(detections[0]["x2"], 16.0);
    }

    // ========================================================================
    // TEST 6: predict_inner - undecodable image is 400, detector error is 500
    // ========================================================================
    #[tokio::test]
    async fn test_predict_inner_error_statuses() {
        let detector = MockDetector { calls: AtomicUsize::new(0) };
        let req = PredictRequest { image: Some("data:image/png;base64,!!!".to_string()) };
        let (status, _) = predict_inner(Some(&detector), 0.5, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = PredictRequest { image: Some(jpeg_data_url()) };
        let (status, body) = predict_inner(Some(&BrokenDetector), 0.5, req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("session poisoned"));
    }

    // ========================================================================
    // TEST 7: save_rating_inner - validation and persistence
    // ========================================================================
    #[tokio::test]
    async fn test_save_rating_inner() {
        let state = make_state().await;

        let (status, _) = save_rating_inner(&state.pool, SaveRatingRequest::default()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = SaveRatingRequest {
            stars: Some(1),
            detections: Some(vec![]),
            image_source: Some("camera".to_string()),
        };
        let (status, body) = save_rating_inner(&state.pool, req).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["id"].as_i64().unwrap() > 0);
    }

    // ========================================================================
    // TEST 8: retrain_inner - busy lock is 409, otherwise reports outcome
    // ========================================================================
    #[tokio::test]
    async fn test_retrain_inner_conflict_and_outcome() {
        let state = make_state().await;

        let guard = state.retrain_lock.lock().await;
        let (status, _) = retrain_inner(&state).await;
        assert_eq!(status, StatusCode::CONFLICT);
        drop(guard);

        let (status, body) = retrain_inner(&state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "not_eligible");
        assert_eq!(body["required"], 2);
    }

    // ========================================================================
    // TEST 9: retrain_log_inner - clamps limit, newest first
    // ========================================================================
    #[tokio::test]
    async fn test_retrain_log_inner() {
        let state = make_state().await;
        let t = Utc::now();
        store::append_retrain_log(&state.pool, t - chrono::Duration::days(2), 2, "old").await.unwrap();
        store::append_retrain_log(&state.pool, t, 3, "new").await.unwrap();

        let (status, body) = retrain_log_inner(&state.pool, RetrainLogQuery { limit: Some(0) }).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["details"], "new");
    }
}
