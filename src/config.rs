use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

/// Where uploads, frame caches and model artifacts live.
///
/// Relative paths are interpreted against the working directory, the same
/// way stored media locations are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,

    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("static/uploads")
}

fn default_frames_dir() -> PathBuf {
    PathBuf::from("static/frames")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            frames_dir: default_frames_dir(),
            models_dir: default_models_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Seconds between sampled frames on the first pass.
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: f64,

    /// Finer interval used when the first pass yields nothing.
    #[serde(default = "default_fallback_interval_secs")]
    pub fallback_interval_secs: f64,

    /// Upper bound on frames written per video.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,

    /// Frame rate assumed when the container reports none.
    #[serde(default = "default_fallback_fps")]
    pub fallback_fps: f64,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,

    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
}

fn default_interval_secs() -> f64 {
    3.0
}

fn default_fallback_interval_secs() -> f64 {
    0.5
}

fn default_max_frames() -> usize {
    200
}

fn default_fallback_fps() -> f64 {
    30.0
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            fallback_interval_secs: default_fallback_interval_secs(),
            max_frames: default_max_frames(),
            fallback_fps: default_fallback_fps(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Fraction of samples held out for scoring.
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Passes over the training split.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// SVM regularization strength (lambda).
    #[serde(default = "default_regularization")]
    pub regularization: f64,

    /// A running job whose status has not changed for this long is treated
    /// as abandoned and no longer blocks a new start.
    #[serde(default = "default_stale_job_secs")]
    pub stale_job_secs: u64,
}

fn default_test_ratio() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    30
}

fn default_regularization() -> f64 {
    1e-4
}

fn default_stale_job_secs() -> u64 {
    3600
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_ratio: default_test_ratio(),
            seed: default_seed(),
            epochs: default_epochs(),
            regularization: default_regularization(),
            stale_job_secs: default_stale_job_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Cached frames scored per video evaluation.
    #[serde(default = "default_eval_max_frames")]
    pub max_frames: usize,
}

fn default_eval_max_frames() -> usize {
    100
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_frames: default_eval_max_frames(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("classmark")
        .join("classmark.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage: StorageConfig::default(),
            sampler: SamplerConfig::default(),
            training: TrainingConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl Config {
    /// Load from `CLASSMARK_CONFIG` or the default location, writing the
    /// defaults out when no file exists yet.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os("CLASSMARK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("classmark")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
