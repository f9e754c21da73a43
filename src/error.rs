//! Error taxonomy for the frame, dataset, training and evaluation pipeline.

use std::path::PathBuf;

/// Errors surfaced by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("media file not found for record {media_id}: {filename}")]
    MediaNotFound { media_id: i64, filename: String },

    #[error("cannot open video {path}: {reason}")]
    VideoOpen { path: PathBuf, reason: String },

    #[error("video file is missing or empty: {0}")]
    VideoEmpty(PathBuf),

    #[error("cannot prepare frame directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no frames could be extracted for record {media_id}")]
    NoFrames { media_id: i64 },

    #[error("no usable training samples ({skipped} annotations skipped)")]
    EmptyDataset { skipped: usize },

    #[error("no annotated media available for training")]
    NoAnnotatedData,

    #[error("a training job is already running")]
    Busy,

    #[error("training failed: {0}")]
    TrainingFailure(String),

    #[error("cannot load model artifact {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("media record {0} does not exist")]
    UnknownMedia(i64),

    #[error("model {0} does not exist")]
    UnknownModel(i64),

    #[error("unsupported media file: {0}")]
    UnsupportedMedia(String),

    #[error("behavior key already exists: {0}")]
    DuplicateBehavior(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
