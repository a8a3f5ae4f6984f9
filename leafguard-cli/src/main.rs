//! leafguard-cli - operator frontend for the Leafguard service
//!
//! # Subcommands
//! - `predict <image> [--json]`                 - run detection on an image file
//! - `rate <image> --stars <1-5> [--source s]`  - predict, then store a rating for the result
//! - `retrain`                                  - run one retraining check now
//! - `history [-n <limit>]`                     - recent retraining executions
//! - `status`                                   - show server health
//! - `split [--config path] [--seed n]`         - build train/val/test splits locally

use std::path::{Path, PathBuf};

use base64::Engine;
use clap::{Parser, Subcommand};
use leafguard_core::LeafguardConfig;
use leafguard_dataset::DatasetGenerator;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";
const DEFAULT_HISTORY: i64 = 10;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "leafguard-cli",
    version,
    about = "Leafguard plant leaf disease detection - operator CLI"
)]
struct Cli {
    /// Leafguard HTTP server URL (overrides LEAFGUARD_HTTP_URL env var)
    #[arg(long, env = "LEAFGUARD_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect diseases in an image file
    Predict {
        image: PathBuf,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Predict an image and store a star rating for the detections
    Rate {
        image: PathBuf,

        /// Rating from 1 (wrong) to 5 (correct)
        #[arg(short, long)]
        stars: i64,

        /// Image source tag stored with the rating (defaults to the file name)
        #[arg(long)]
        source: Option<String>,
    },

    /// Run one retraining check immediately
    Retrain,

    /// Show recent retraining executions
    History {
        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY)]
        limit: i64,
    },

    /// Show Leafguard server status
    Status,

    /// Build the train/val/test dataset from the raw image pool
    Split {
        #[arg(short, long, default_value = "leafguard.toml")]
        config: String,

        /// Fixed seed for a reproducible split (overrides the config)
        #[arg(long)]
        seed: Option<u64>,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class: String,
}

#[derive(Debug, Deserialize)]
pub struct PredictResponse {
    pub detections: Vec<ApiDetection>,
}

#[derive(Debug, Deserialize)]
pub struct LogEntry {
    pub executed_at: String,
    pub num_records: i64,
    pub details: String,
}

#[derive(Debug, Deserialize)]
pub struct LogResponse {
    pub entries: Vec<LogEntry>,
}

// ============================================================================
// Formatting helpers
// ============================================================================

/// MIME type from the file extension; unknown extensions are sent as JPEG.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

pub fn image_data_url(bytes: &[u8], mime: &str) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

pub fn format_detection(d: &ApiDetection) -> String {
    format!(
        "{:<14} {:>5.1}%  [{:.0}, {:.0}, {:.0}, {:.0}]",
        d.class,
        d.confidence * 100.0,
        d.x1,
        d.y1,
        d.x2,
        d.y2
    )
}

/// One-line summary of a `/retrain` response.
pub fn describe_outcome(body: &serde_json::Value) -> String {
    match body["outcome"].as_str() {
        Some("already_ran_today") => "Retraining already ran today".to_string(),
        Some("not_eligible") => format!(
            "Not enough negative low-confidence ratings ({}/{})",
            body["qualifying"], body["required"]
        ),
        Some("retrained") => format!(
            "Retrained with {} records, {}",
            body["qualifying"],
            if body["promoted"].as_bool().unwrap_or(false) {
                "new model promoted"
            } else {
                "current model kept"
            }
        ),
        _ => format!("Unexpected response: {}", body),
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send a request and return the JSON body, exiting on connection or HTTP errors.
fn call(request: reqwest::blocking::RequestBuilder, url: &str) -> serde_json::Value {
    let resp = match request.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("leafguard-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("leafguard-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    match resp.json() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("leafguard-cli: failed to parse response: {}", e);
            std::process::exit(1);
        }
    }
}

fn request_prediction(server: &str, image: &Path) -> anyhow::Result<serde_json::Value> {
    let bytes = std::fs::read(image)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", image.display(), e))?;
    let url = format!("{}/predict", server);
    let body = serde_json::json!({ "image": image_data_url(&bytes, mime_for(image)) });
    Ok(call(client(60)?.post(&url).json(&body), &url))
}

fn do_predict(server: &str, image: &Path, json_output: bool) -> anyhow::Result<()> {
    let body = request_prediction(server, image)?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let resp: PredictResponse = serde_json::from_value(body)?;
    if resp.detections.is_empty() {
        println!("No detections in {}", image.display());
    }
    for d in &resp.detections {
        println!("{}", format_detection(d));
    }
    Ok(())
}

fn do_rate(server: &str, image: &Path, stars: i64, source: Option<String>) -> anyhow::Result<()> {
    let predicted = request_prediction(server, image)?;
    let source = source.unwrap_or_else(|| {
        image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cli".to_string())
    });

    let url = format!("{}/save_rating", server);
    let body = serde_json::json!({
        "stars": stars,
        "detections": predicted["detections"],
        "image_source": source,
    });
    let saved = call(client(30)?.post(&url).json(&body), &url);
    println!(
        "Rating saved (id {}, {} detections, {} stars)",
        saved["id"],
        predicted["detections"].as_array().map(|a| a.len()).unwrap_or(0),
        stars
    );
    Ok(())
}

fn do_retrain(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/retrain", server);
    // training runs inside this request
    let client = reqwest::blocking::Client::builder().timeout(None).build()?;
    let body = call(client.post(&url), &url);
    println!("{}", describe_outcome(&body));
    Ok(())
}

fn do_history(server: &str, limit: i64) -> anyhow::Result<()> {
    let url = format!("{}/retrain_log?limit={}", server, limit);
    let body = call(client(10)?.get(&url), &url);
    let log: LogResponse = serde_json::from_value(body)?;
    if log.entries.is_empty() {
        println!("No retraining executions yet");
    }
    for e in &log.entries {
        println!("{}  {:>4} records  {}", e.executed_at, e.num_records, e.details);
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Leafguard server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
            println!("SQLite:           {}", body["sqlite"].as_str().unwrap_or("?"));
            println!(
                "Detector:         {}",
                if body["detector"].as_bool().unwrap_or(false) { "loaded" } else { "unavailable" }
            );
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("leafguard-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("leafguard-cli: cannot reach {} - {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn do_split(config_path: &str, seed: Option<u64>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = LeafguardConfig::load(config_path)
        .map_err(|e| anyhow::anyhow!("failed to load config from {}: {}", config_path, e))?;
    let mut dataset = config.dataset.clone();
    if seed.is_some() {
        dataset.seed = seed;
    }

    let generator = DatasetGenerator::new(&dataset);
    let report = generator.run(&config.detector.class_names)?;

    println!("Dataset written to {}", generator.output_dir().display());
    println!("  train: {} images", report.train);
    println!("  val:   {} images", report.val);
    println!("  test:  {} images", report.test);
    println!(
        "  classes: {}, augmented: {}, skipped: {}, without label: {}, shared label: {}",
        report.classes, report.augmented, report.skipped, report.unpaired, report.ambiguous
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Predict { image, json } => do_predict(&server, &image, json),
        Commands::Rate { image, stars, source } => do_rate(&server, &image, stars, source),
        Commands::Retrain => do_retrain(&server),
        Commands::History { limit } => do_history(&server, limit),
        Commands::Status => do_status(&server),
        Commands::Split { config, seed } => do_split(&config, seed),
    };

    if let Err(e) = result {
        eprintln!("leafguard-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
