use std::path::PathBuf;
use thiserror::Error;

use crate::labels::LabelError;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Invalid split ratios: {0}")]
    InvalidRatios(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl DatasetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type DatasetResult<T> = Result<T, DatasetError>;
