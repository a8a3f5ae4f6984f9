use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct LeafguardConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Request body cap. Base64 phone photos run well past axum's 2 MB default.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

fn default_max_body_mb() -> usize {
    25
}

impl HttpConfig {
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_body_mb: default_max_body_mb(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub model_path: String,
    pub class_names: Vec<String>,
    pub input_size: u32,
    /// Detections below this confidence are not returned by /predict.
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "model/potato_leaf_detector.onnx".to_string(),
            class_names: ["Bacteria", "Fungi", "Sano", "Nematodo", "Peste", "Phytophthora"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            input_size: 640,
            confidence_threshold: 0.5,
            iou_threshold: 0.7,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrainConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub lookback_days: i64,
    /// A rated prediction qualifies when any detection is below this confidence.
    pub confidence_threshold: f32,
    pub min_records: usize,
    /// Rating that marks a prediction as negative (lowest on the scale).
    pub min_stars: i64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 6,
            lookback_days: 6,
            confidence_threshold: 0.51,
            min_records: 2,
            min_stars: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    pub python: String,
    pub data_config: String,
    pub epochs: u32,
    pub imgsz: u32,
    pub batch: u32,
    pub patience: u32,
    pub run_name: String,
    pub runs_dir: String,
    /// Artifact path relative to the run directory.
    pub weights_file: String,
    pub current_model: String,
    pub deprecated_model: String,
    pub eval_split: String,
    pub promotion_epsilon: f64,
    pub timeout_minutes: Option<u64>,
    pub export_onnx: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            data_config: "configs/data.yaml".to_string(),
            epochs: 20,
            imgsz: 640,
            batch: 16,
            patience: 10,
            run_name: "yolo11n_run".to_string(),
            runs_dir: "runs/detect".to_string(),
            weights_file: "weights/last.pt".to_string(),
            current_model: "model/potato_leaf_detector.pt".to_string(),
            deprecated_model: "model/potato_leaf_detector_deprecated.pt".to_string(),
            eval_split: "test".to_string(),
            promotion_epsilon: 1e-4,
            timeout_minutes: None,
            export_onnx: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Allocate class by class; an image is locked into the split chosen for
    /// the first of its classes that gets processed.
    #[default]
    GreedyPerClass,
    /// One shuffle over all images, split by the exact ratios.
    Global,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub raw_images_dir: String,
    pub raw_labels_dir: String,
    pub output_dir: String,
    pub train_ratio: f64,
    pub val_ratio: f64,
    pub test_ratio: f64,
    pub seed: Option<u64>,
    pub workers: usize,
    #[serde(default)]
    pub strategy: PartitionStrategy,
    pub augmentation: Option<AugmentationConfig>,
    /// Write a trainer data.yaml next to the splits when set.
    pub data_yaml: Option<String>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            raw_images_dir: "raw_dataset/images".to_string(),
            raw_labels_dir: "raw_dataset/labels".to_string(),
            output_dir: "dataset".to_string(),
            train_ratio: 0.70,
            val_ratio: 0.20,
            test_ratio: 0.10,
            seed: None,
            workers: 8,
            strategy: PartitionStrategy::default(),
            augmentation: None,
            data_yaml: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AugmentationConfig {
    /// Chance that an image goes through the transform pipeline at all.
    pub probability: f64,
    pub zoom_min: f32,
    pub zoom_max: f32,
    pub pad_color: [u8; 3],
    pub blur_probability: f64,
    /// Relative weights for gaussian, median and motion blur.
    pub blur_weights: [u32; 3],
    pub gaussian_sigma: f32,
    pub median_radius: u32,
    pub motion_length: u32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            probability: 0.3,
            zoom_min: 0.5,
            zoom_max: 0.9,
            pad_color: [114, 114, 114],
            blur_probability: 0.5,
            blur_weights: [5, 3, 2],
            gaussian_sigma: 1.5,
            median_radius: 2,
            motion_length: 7,
        }
    }
}

impl LeafguardConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("LEAFGUARD").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Every section at its default around the given database.
    pub fn with_database(database: DatabaseConfig) -> Self {
        Self {
            service: ServiceConfig::default(),
            database,
            http: HttpConfig::default(),
            detector: DetectorConfig::default(),
            retrain: RetrainConfig::default(),
            training: TrainingConfig::default(),
            dataset: DatasetConfig::default(),
        }
    }
}

/// Expand a leading `~` in a configured path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

impl DatasetConfig {
    /// Worker count for the copy phase; 0 means one per CPU.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}
