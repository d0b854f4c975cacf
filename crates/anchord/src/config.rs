use std::path::{Path, PathBuf};

use anchor_core::DEFAULT_SIMILARITY_THRESHOLD;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Loaded from the TOML file named by `ANCHOR_CONFIG` (if set), then
/// overridden field by field from `ANCHOR_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address (default: 127.0.0.1).
    pub host: String,
    /// Bind port (default: 8000).
    pub port: u16,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Scratch directory for uploads awaiting embedding extraction.
    pub temp_dir: PathBuf,
    /// Root of the durable face image store, served under `/images`.
    pub storage_dir: PathBuf,
    /// Base URL for public image links. Derived from host/port when unset.
    pub public_base_url: Option<String>,
    /// Base URL of the face-recognition service.
    pub embedding_url: String,
    /// Dimensionality every stored and queried embedding must have.
    pub embedding_dim: usize,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Timeout in seconds for one embedding request.
    pub provider_timeout_secs: u64,
    /// Maximum accepted request body size.
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            db_path: data_dir.join("faces.db"),
            temp_dir: std::env::temp_dir().join("anchor").join("face_images"),
            storage_dir: data_dir.join("face-images"),
            public_base_url: None,
            embedding_url: "http://127.0.0.1:5001".to_string(),
            embedding_dim: 512,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            provider_timeout_secs: 30,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ANCHOR_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ANCHOR_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ANCHOR_HOST") {
            self.host = v;
        }
        override_parsed(&lookup, "ANCHOR_PORT", &mut self.port);
        if let Some(v) = lookup("ANCHOR_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANCHOR_TEMP_DIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANCHOR_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANCHOR_PUBLIC_BASE_URL") {
            self.public_base_url = Some(v);
        }
        if let Some(v) = lookup("ANCHOR_EMBEDDING_URL") {
            self.embedding_url = v;
        }
        override_parsed(&lookup, "ANCHOR_EMBEDDING_DIM", &mut self.embedding_dim);
        override_parsed(
            &lookup,
            "ANCHOR_SIMILARITY_THRESHOLD",
            &mut self.similarity_threshold,
        );
        override_parsed(
            &lookup,
            "ANCHOR_PROVIDER_TIMEOUT_SECS",
            &mut self.provider_timeout_secs,
        );
        override_parsed(&lookup, "ANCHOR_MAX_UPLOAD_BYTES", &mut self.max_upload_bytes);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be positive".into()));
        }
        if self.provider_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "provider_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL prefixed to durable image paths.
    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}/images", self.bind_addr()),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("anchor")
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}
