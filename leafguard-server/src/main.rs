use std::sync::Arc;

use clap::Parser;
use leafguard_core::{Detector, LeafguardConfig, OnnxDetector, TrainingBackend, UltralyticsBackend};
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::{fmt, EnvFilter};

use leafguard_server::http::{self, HttpState};
use leafguard_server::subsystems::retrain_executor::RetrainExecutor;
use leafguard_server::subsystems::retrain_trigger::{self, Retrainer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "leafguard.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match LeafguardConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging (RUST_LOG wins over the configured level)
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    // Connect to DB
    let pool = match leafguard_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open database {}: {}", config.database.url, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match leafguard_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ SQLite connected: {}", v),
            Err(e) => {
                println!("❌ SQLite connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match OnnxDetector::new(&config.detector) {
            Ok(_) => println!("✅ Detector model loaded: {}", config.detector.model_path),
            Err(e) => println!("⚠️  Detector unavailable: {}", e),
        }

        println!("✅ Leafguard health check passed");
        return Ok(());
    }

    leafguard_core::db::init_schema(&pool).await?;

    let detector: Option<Arc<dyn Detector>> = match OnnxDetector::new(&config.detector) {
        Ok(d) => {
            tracing::info!(model = %config.detector.model_path, "Detector loaded");
            Some(Arc::new(d))
        }
        Err(e) => {
            tracing::warn!("Detector unavailable, /predict will answer 503: {}", e);
            None
        }
    };

    let backend: Arc<dyn TrainingBackend> = Arc::new(UltralyticsBackend::new(&config.training));
    let retrainer: Arc<dyn Retrainer> =
        Arc::new(RetrainExecutor::new(backend, config.training.clone()));
    let retrain_lock = Arc::new(Mutex::new(()));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Spawn retraining background loop
    let retrain_handle = tokio::spawn(retrain_trigger::run_retrain_loop(
        pool.clone(),
        retrainer.clone(),
        config.retrain.clone(),
        retrain_lock.clone(),
        tx.subscribe(),
    ));

    if config.http.enabled {
        let state = Arc::new(HttpState {
            pool,
            config: config.clone(),
            detector,
            retrainer,
            retrain_lock,
        });
        http::start_http_server(state, tx.subscribe()).await?;
    } else {
        tracing::info!("HTTP API disabled, running retraining loop only");
        let mut shutdown = tx.subscribe();
        let _ = shutdown.recv().await;
    }

    // Aborting drops any in-flight training process (kill_on_drop)
    retrain_handle.abort();
    tracing::info!("Leafguard stopped");
    Ok(())
}
