use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = TryOnError> = std::result::Result<T, E>;

/// Errors raised by the try-on training pipeline.
#[derive(Error, Debug)]
pub enum TryOnError {
    #[error("expected {expected} pyramid scales for `{field}`, got {actual}")]
    ScaleCount {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("shape mismatch in {context}: {left:?} vs {right:?}")]
    ShapeMismatch {
        context: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("generator must produce {expected} channels, got {actual}")]
    GeneratorChannels { expected: usize, actual: usize },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("failed to open image {path}")]
    ImageOpen {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid pose keypoints in {path}: {reason}")]
    PoseKeypoints { path: PathBuf, reason: String },

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("checkpoint error at {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("invalid configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("gradient collective failed: {0}")]
    Collective(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TryOnError {
    pub fn shape_mismatch(context: impl Into<String>, left: &[usize], right: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }
}
