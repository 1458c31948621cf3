//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encoding-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    /// Target codec for re-encoding: "hevc", "h264", or "av1"
    #[serde(default = "default_target_codec")]
    pub target_codec: String,
    /// Encoder preset (fast, medium, slow, veryslow)
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Manual CRF override (None = derive from source quality)
    #[serde(default)]
    pub crf: Option<u8>,
    /// Downscale sources above 1080p
    #[serde(default)]
    pub downscale: bool,
    /// Recovery mode: tolerate decode errors in damaged sources
    #[serde(default)]
    pub recover: bool,
}

fn default_target_codec() -> String {
    "hevc".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            target_codec: default_target_codec(),
            preset: default_preset(),
            crf: None,
            downscale: false,
            recover: false,
        }
    }
}

/// Network queue pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Local staging directory (None = system temp + "videosentinel")
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Max files buffered locally between download and upload (valid 2-5)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Max on-disk staging size in GiB
    #[serde(default = "default_max_temp_size_gb")]
    pub max_temp_size_gb: f64,
}

fn default_buffer_size() -> usize {
    4
}

fn default_max_temp_size_gb() -> f64 {
    50.0
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            buffer_size: default_buffer_size(),
            max_temp_size_gb: default_max_temp_size_gb(),
        }
    }
}

/// Duplicate detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicatesConfig {
    /// Perceptual hash side length (hash is hash_size^2 bits per frame)
    #[serde(default = "default_hash_size")]
    pub hash_size: usize,
    /// Number of frames sampled per video
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Mean Hamming distance at or below which two videos are duplicates
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Max duration difference tolerated inside a filename group
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance_secs: f64,
}

fn default_hash_size() -> usize {
    12
}

fn default_samples() -> usize {
    10
}

fn default_threshold() -> f64 {
    15.0
}

fn default_duration_tolerance() -> f64 {
    2.0
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            hash_size: default_hash_size(),
            samples: default_samples(),
            threshold: default_threshold(),
            duration_tolerance_secs: default_duration_tolerance(),
        }
    }
}

/// Directory scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ScanConfig {
    /// Recurse into subdirectories
    #[serde(default)]
    pub recursive: bool,
    /// Restrict re-encoding to these extensions (e.g. ["wmv", "avi"])
    #[serde(default)]
    pub file_types: Option<Vec<String>>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields fall back to defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDEOSENTINEL_TARGET_CODEC -> encoding.target_codec
    /// - VIDEOSENTINEL_PRESET -> encoding.preset
    /// - VIDEOSENTINEL_CRF -> encoding.crf
    /// - VIDEOSENTINEL_TEMP_DIR -> queue.temp_dir
    /// - VIDEOSENTINEL_BUFFER_SIZE -> queue.buffer_size
    /// - VIDEOSENTINEL_MAX_TEMP_SIZE_GB -> queue.max_temp_size_gb
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDEOSENTINEL_TARGET_CODEC") {
            if !val.is_empty() {
                self.encoding.target_codec = val.to_lowercase();
            }
        }

        if let Ok(val) = env::var("VIDEOSENTINEL_PRESET") {
            if !val.is_empty() {
                self.encoding.preset = val;
            }
        }

        if let Ok(val) = env::var("VIDEOSENTINEL_CRF") {
            if let Ok(crf) = val.parse::<u8>() {
                self.encoding.crf = Some(crf);
            }
        }

        if let Ok(val) = env::var("VIDEOSENTINEL_TEMP_DIR") {
            if !val.is_empty() {
                self.queue.temp_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("VIDEOSENTINEL_BUFFER_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                self.queue.buffer_size = size;
            }
        }

        if let Ok(val) = env::var("VIDEOSENTINEL_MAX_TEMP_SIZE_GB") {
            if let Ok(gb) = val.parse::<f64>() {
                self.queue.max_temp_size_gb = gb;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("VIDEOSENTINEL_TARGET_CODEC");
        env::remove_var("VIDEOSENTINEL_PRESET");
        env::remove_var("VIDEOSENTINEL_CRF");
        env::remove_var("VIDEOSENTINEL_TEMP_DIR");
        env::remove_var("VIDEOSENTINEL_BUFFER_SIZE");
        env::remove_var("VIDEOSENTINEL_MAX_TEMP_SIZE_GB");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.encoding.target_codec, "hevc");
        assert_eq!(config.encoding.preset, "medium");
        assert_eq!(config.encoding.crf, None);
        assert!(!config.encoding.downscale);
        assert!(!config.encoding.recover);
        assert_eq!(config.queue.buffer_size, 4);
        assert!((config.queue.max_temp_size_gb - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.duplicates.hash_size, 12);
        assert_eq!(config.duplicates.samples, 10);
        assert!((config.duplicates.threshold - 15.0).abs() < f64::EPSILON);
        assert!(!config.scan.recursive);
    }

    #[test]
    fn test_parse_empty_toml_uses_defaults() {
        let config = Config::parse_toml("").expect("empty TOML should parse");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_all_sections() {
        let toml_str = r#"
[encoding]
target_codec = "av1"
preset = "slow"
crf = 30
downscale = true
recover = true

[queue]
temp_dir = "/scratch/vs"
buffer_size = 3
max_temp_size_gb = 20.0

[duplicates]
hash_size = 8
samples = 5
threshold = 10.0
duration_tolerance_secs = 1.0

[scan]
recursive = true
file_types = ["wmv", "avi"]
"#;

        let config = Config::parse_toml(toml_str).expect("valid TOML should parse");
        assert_eq!(config.encoding.target_codec, "av1");
        assert_eq!(config.encoding.preset, "slow");
        assert_eq!(config.encoding.crf, Some(30));
        assert!(config.encoding.downscale);
        assert!(config.encoding.recover);
        assert_eq!(config.queue.temp_dir, Some(PathBuf::from("/scratch/vs")));
        assert_eq!(config.queue.buffer_size, 3);
        assert!((config.queue.max_temp_size_gb - 20.0).abs() < f64::EPSILON);
        assert_eq!(config.duplicates.hash_size, 8);
        assert_eq!(config.duplicates.samples, 5);
        assert_eq!(
            config.scan.file_types,
            Some(vec!["wmv".to_string(), "avi".to_string()])
        );
    }

    #[test]
    fn test_partial_section_uses_field_defaults() {
        let toml_str = r#"
[encoding]
target_codec = "h264"
"#;
        let config = Config::parse_toml(toml_str).expect("valid TOML should parse");
        assert_eq!(config.encoding.target_codec, "h264");
        assert_eq!(config.encoding.preset, "medium");
        assert_eq!(config.queue.buffer_size, 4);
    }

    #[test]
    fn test_invalid_toml_fails() {
        let result = Config::parse_toml("[encoding\ntarget_codec = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("VIDEOSENTINEL_TARGET_CODEC", "AV1");
        env::set_var("VIDEOSENTINEL_CRF", "27");
        env::set_var("VIDEOSENTINEL_BUFFER_SIZE", "5");
        env::set_var("VIDEOSENTINEL_TEMP_DIR", "/mnt/fast");

        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoding.target_codec, "av1");
        assert_eq!(config.encoding.crf, Some(27));
        assert_eq!(config.queue.buffer_size, 5);
        assert_eq!(config.queue.temp_dir, Some(PathBuf::from("/mnt/fast")));
    }

    #[test]
    fn test_env_override_invalid_numbers_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("VIDEOSENTINEL_CRF", "not-a-number");
        env::set_var("VIDEOSENTINEL_BUFFER_SIZE", "-1");

        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoding.crf, None);
        assert_eq!(config.queue.buffer_size, 4);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[encoding]\ntarget_codec = \"h264\"\n").unwrap();

        let config = Config::load_from_file(&path).expect("should load");
        assert_eq!(config.encoding.target_codec, "h264");
    }
}
