use crate::engine::EngineOptions;
use presence_core::DEFAULT_MATCH_THRESHOLD;
use presence_hw::CaptureOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Camera acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device to open; the first enumerated device when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub surface_attempts: u32,
    pub surface_interval_ms: u64,
    pub ready_timeout_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let defaults = CaptureOptions::default();
        Self {
            device: None,
            width: defaults.ideal_width,
            height: defaults.ideal_height,
            surface_attempts: defaults.surface_attempts,
            surface_interval_ms: defaults.surface_interval.as_millis() as u64,
            ready_timeout_secs: defaults.ready_timeout.as_secs(),
        }
    }
}

/// Engine configuration: defaults, then an optional TOML file, then
/// `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite descriptor database.
    pub db_path: PathBuf,
    /// Euclidean distance threshold for a positive match (inclusive).
    pub match_threshold: f32,
    pub recognition_interval_ms: u64,
    /// Samples captured per enrollment.
    pub enroll_samples: usize,
    pub enroll_sample_delay_ms: u64,
    pub camera: CameraConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            recognition_interval_ms: 1000,
            enroll_samples: 3,
            enroll_sample_delay_ms: 500,
            camera: CameraConfig::default(),
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if std::env::var_os("PRESENCE_CONFIG").is_some() => {
                return Err(ConfigError::Read {
                    path,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay `PRESENCE_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        env_parse(&lookup, "PRESENCE_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parse(&lookup, "PRESENCE_RECOGNITION_INTERVAL_MS", &mut self.recognition_interval_ms);
        env_parse(&lookup, "PRESENCE_ENROLL_SAMPLES", &mut self.enroll_samples);
        env_parse(&lookup, "PRESENCE_ENROLL_DELAY_MS", &mut self.enroll_sample_delay_ms);
        if let Some(device) = lookup("PRESENCE_CAMERA_DEVICE") {
            self.camera.device = Some(device).filter(|d| !d.is_empty());
        }
        env_parse(&lookup, "PRESENCE_CAMERA_WIDTH", &mut self.camera.width);
        env_parse(&lookup, "PRESENCE_CAMERA_HEIGHT", &mut self.camera.height);
        env_parse(&lookup, "PRESENCE_READY_TIMEOUT_SECS", &mut self.camera.ready_timeout_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                self.match_threshold
            )));
        }
        if self.enroll_samples == 0 {
            return Err(ConfigError::Invalid("enroll_samples must be at least 1".into()));
        }
        if self.recognition_interval_ms == 0 {
            return Err(ConfigError::Invalid("recognition_interval_ms must be positive".into()));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid("camera resolution must be non-zero".into()));
        }
        if self.camera.surface_attempts == 0 {
            return Err(ConfigError::Invalid("camera.surface_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            match_threshold: self.match_threshold,
            recognition_interval: Duration::from_millis(self.recognition_interval_ms),
            enroll_samples: self.enroll_samples,
            enroll_sample_delay: Duration::from_millis(self.enroll_sample_delay_ms),
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            ideal_width: self.camera.width,
            ideal_height: self.camera.height,
            preferred_device: self.camera.device.clone(),
            surface_attempts: self.camera.surface_attempts,
            surface_interval: Duration::from_millis(self.camera.surface_interval_ms),
            ready_timeout: Duration::from_secs(self.camera.ready_timeout_secs),
        }
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

/// `$XDG_DATA_HOME/presence/descriptors.db`.
pub fn default_db_path() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
        .join("presence")
        .join("descriptors.db")
}

/// `PRESENCE_CONFIG`, else `$XDG_CONFIG_HOME/presence/config.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("PRESENCE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    Some(xdg_dir("XDG_CONFIG_HOME", ".config").join("presence").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = Config::default();
        assert_eq!(config.engine_options(), EngineOptions::default());
        assert_eq!(config.capture_options(), CaptureOptions::default());
        assert!(config.db_path.ends_with("presence/descriptors.db"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            match_threshold = 0.5
            db_path = "/var/lib/presence/db.sqlite"

            [camera]
            device = "/dev/video2"
            "#,
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/presence/db.sqlite"));
        assert_eq!(config.camera.device.as_deref(), Some("/dev/video2"));
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.enroll_samples, 3);
        assert_eq!(config.capture_options().preferred_device.as_deref(), Some("/dev/video2"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(Config::from_toml_str("match_threshold = \"high\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("PRESENCE_DB_PATH", "/tmp/p.db"),
            ("PRESENCE_MATCH_THRESHOLD", "0.45"),
            ("PRESENCE_RECOGNITION_INTERVAL_MS", "250"),
            ("PRESENCE_ENROLL_SAMPLES", "5"),
            ("PRESENCE_CAMERA_DEVICE", "/dev/video4"),
            ("PRESENCE_CAMERA_WIDTH", "640"),
            ("PRESENCE_READY_TIMEOUT_SECS", "3"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/tmp/p.db"));
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.engine_options().recognition_interval, Duration::from_millis(250));
        assert_eq!(config.enroll_samples, 5);
        assert_eq!(config.camera.device.as_deref(), Some("/dev/video4"));
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.camera.height, 720);
        assert_eq!(config.capture_options().ready_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("PRESENCE_ENROLL_SAMPLES", "lots")]));
        assert_eq!(config.enroll_samples, 3);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.match_threshold = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.enroll_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serializes_to_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("match_threshold"));
        assert!(!text.contains("device"));
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }
}
