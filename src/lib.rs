//! Teaching-behavior annotation: media import, video frame sampling and
//! caching, dataset building, classifier training and evaluation.

pub mod app;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod evaluate;
pub mod logging;
pub mod media;
pub mod training;
pub mod vocabulary;

pub use error::{Error, Result};
