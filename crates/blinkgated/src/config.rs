use blinkgate_core::liveness::{DEFAULT_CLOSE_THRESHOLD, DEFAULT_REOPEN_THRESHOLD};
use blinkgate_core::types::DEFAULT_REQUIRED_BLINKS;
use blinkgate_core::{CheckInConfig, LivenessConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built-in defaults, overlaid by the TOML file named in `BLINKGATE_CONFIG`
/// (if any), overlaid by `BLINKGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Face detector file name inside `model_dir`.
    pub detector_model: String,
    /// Face-mesh landmark model file name inside `model_dir`.
    pub landmark_model: String,
    /// Embedding model file name inside `model_dir`.
    pub embedding_model: String,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// EAR below which the eyes count as closing.
    pub close_threshold: f32,
    /// EAR above which closing eyes count as open again.
    pub reopen_threshold: f32,
    /// Blinks required for new enrollments (stored per user).
    pub required_blinks: u32,
    /// Capture budget per check-in, in media time.
    pub time_budget_ms: u64,
    /// Wall-clock limit per check-in.
    pub wall_clock_limit_ms: u64,
    /// Per-call inference timeout.
    pub inference_timeout_ms: u64,
    /// Frames buffered between capture and inference.
    pub frame_queue_depth: usize,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

/// Optional overlay file; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    detector_model: Option<String>,
    landmark_model: Option<String>,
    embedding_model: Option<String>,
    similarity_threshold: Option<f32>,
    close_threshold: Option<f32>,
    reopen_threshold: Option<f32>,
    required_blinks: Option<u32>,
    time_budget_ms: Option<u64>,
    wall_clock_limit_ms: Option<u64>,
    inference_timeout_ms: Option<u64>,
    frame_queue_depth: Option<usize>,
    session_bus: Option<bool>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_sources(&vars)
    }

    /// Build configuration from an explicit variable map.
    pub fn from_sources(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let file = match vars.get("BLINKGATE_CONFIG") {
            Some(path) => read_file_config(Path::new(path))?,
            None => FileConfig::default(),
        };

        let data_dir = vars
            .get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = vars.get("HOME").map(String::as_str).unwrap_or("/tmp");
                PathBuf::from(home).join(".local/share")
            })
            .join("blinkgate");

        let model_dir = vars
            .get("BLINKGATE_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let db_path = vars
            .get("BLINKGATE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("blinkgate.db"));

        let config = Self {
            model_dir,
            db_path,
            detector_model: env_string(vars, "BLINKGATE_DETECTOR_MODEL")
                .or(file.detector_model)
                .unwrap_or_else(|| "det_10g.onnx".to_string()),
            landmark_model: env_string(vars, "BLINKGATE_LANDMARK_MODEL")
                .or(file.landmark_model)
                .unwrap_or_else(|| "face_landmark.onnx".to_string()),
            embedding_model: env_string(vars, "BLINKGATE_EMBEDDING_MODEL")
                .or(file.embedding_model)
                .unwrap_or_else(|| "w600k_r50.onnx".to_string()),
            similarity_threshold: env_f32(
                vars,
                "BLINKGATE_SIMILARITY_THRESHOLD",
                file.similarity_threshold.unwrap_or(0.6),
            ),
            close_threshold: env_f32(
                vars,
                "BLINKGATE_CLOSE_THRESHOLD",
                file.close_threshold.unwrap_or(DEFAULT_CLOSE_THRESHOLD),
            ),
            reopen_threshold: env_f32(
                vars,
                "BLINKGATE_REOPEN_THRESHOLD",
                file.reopen_threshold.unwrap_or(DEFAULT_REOPEN_THRESHOLD),
            ),
            required_blinks: env_u32(
                vars,
                "BLINKGATE_REQUIRED_BLINKS",
                file.required_blinks.unwrap_or(DEFAULT_REQUIRED_BLINKS),
            ),
            time_budget_ms: env_u64(
                vars,
                "BLINKGATE_TIME_BUDGET_MS",
                file.time_budget_ms.unwrap_or(5000),
            ),
            wall_clock_limit_ms: env_u64(
                vars,
                "BLINKGATE_WALL_CLOCK_LIMIT_MS",
                file.wall_clock_limit_ms.unwrap_or(15_000),
            ),
            inference_timeout_ms: env_u64(
                vars,
                "BLINKGATE_INFERENCE_TIMEOUT_MS",
                file.inference_timeout_ms.unwrap_or(2000),
            ),
            frame_queue_depth: env_usize(
                vars,
                "BLINKGATE_FRAME_QUEUE_DEPTH",
                file.frame_queue_depth.unwrap_or(4),
            ),
            session_bus: vars.contains_key("BLINKGATE_SESSION_BUS")
                || file.session_bus.unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if !(self.close_threshold < self.reopen_threshold) {
            return Err(ConfigError::Invalid(format!(
                "close_threshold {} must be below reopen_threshold {}",
                self.close_threshold, self.reopen_threshold
            )));
        }
        if self.frame_queue_depth == 0 {
            return Err(ConfigError::Invalid("frame_queue_depth must be at least 1".into()));
        }
        if self.time_budget_ms == 0 || self.wall_clock_limit_ms == 0 || self.inference_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Per-attempt parameters handed to the orchestrator.
    pub fn check_in_config(&self) -> CheckInConfig {
        CheckInConfig {
            similarity_threshold: self.similarity_threshold,
            liveness: LivenessConfig {
                close_threshold: self.close_threshold,
                reopen_threshold: self.reopen_threshold,
                ..LivenessConfig::default()
            },
            required_blinks: self.required_blinks,
            time_budget: Duration::from_millis(self.time_budget_ms),
            wall_clock_limit: Duration::from_millis(self.wall_clock_limit_ms),
            inference_timeout: Duration::from_millis(self.inference_timeout_ms),
            frame_queue_depth: self.frame_queue_depth,
            ..CheckInConfig::default()
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn landmark_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.landmark_model)
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedding_model)
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_string(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

fn env_f32(vars: &HashMap<String, String>, key: &str, default: f32) -> f32 {
    vars.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(vars: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    vars.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    vars.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(vars: &HashMap<String, String>, key: &str, default: usize) -> usize {
    vars.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
