use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};

use crate::protocol::constants::{DEFAULT_READ_CHUNK, DEFAULT_SINK_CAPACITY};

pub const DEFAULT_CONFIG_FILE: &str = "localbucket.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bucket: String,
    pub prefix: PathBuf,
    pub read_chunk_size: usize,
    pub sink_capacity: usize,
    // Credentials of the real service; accepted so the same file works for
    // both clients, never checked here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: default_prefix(),
            read_chunk_size: DEFAULT_READ_CHUNK,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            key: None,
            secret: None,
        }
    }
}

pub fn default_prefix() -> PathBuf {
    std::env::temp_dir().join("localbucket")
}

impl ClientConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Loads a `.json` file (the real client's credentials format) or TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(config)
    }

    /// Loads `path` if given, otherwise the default file when present.
    pub fn load_or_default(config_path: Option<&str>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, config_path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            bail!("bucket name is required");
        }
        if self.bucket == "." || self.bucket == ".." || self.bucket.contains(['/', '\\']) {
            bail!("invalid bucket name: {:?}", self.bucket);
        }
        Ok(())
    }

    pub fn bucket_path(&self) -> PathBuf {
        self.prefix.join(&self.bucket)
    }

    /// Creates the storage root and bucket directory when absent and returns
    /// the bucket directory. Existing data is left alone.
    pub fn ensure_directories(&self) -> Result<PathBuf> {
        self.validate()?;

        if !self.prefix.exists() {
            std::fs::create_dir_all(&self.prefix)
                .with_context(|| format!("creating storage root {:?}", self.prefix))?;
            tracing::info!("Created storage root: {:?}", self.prefix);
        }

        let bucket_path = self.bucket_path();
        if !bucket_path.exists() {
            std::fs::create_dir(&bucket_path)
                .with_context(|| format!("creating bucket directory {:?}", bucket_path))?;
            tracing::info!("Created bucket directory: {:?}", bucket_path);
        }
        Ok(bucket_path)
    }
}
