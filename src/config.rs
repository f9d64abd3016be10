use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Settings of a [`crate::MediaCache`].
///
/// Missing fields fall back to [`CacheConfig::default`] when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory where cached chunks and the media catalog are stored.
    pub base_path: PathBuf,
    /// Whether to pick up the chunks and catalog left behind by a previous instance.
    pub resume: bool,
    /// Hard cap on concurrent upstream fetches.
    pub max_downloaders: usize,
    /// Fetch slots reserved for synchronous client reads.
    pub priority_downloaders: usize,
    /// Largest byte range a single upstream fetch covers.
    pub chunk_size: u64,
    /// Bytes past a served range to prefetch on the `buffer` lane. Zero disables read-ahead.
    pub read_ahead: u64,
}

impl CacheConfig {
    pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

    pub fn new<P>(base_path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    /// Reads the configuration from a JSON file.
    #[tracing::instrument(fields(path = format_args!("{}", path.as_ref().display())), err(Debug))]
    pub async fn from_json_file<P>(path: P) -> CacheResult<Self>
    where
        P: AsRef<Path>,
    {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.chunk_size == 0 {
            return Err(CacheError::Config("chunk_size must be positive".to_owned()));
        }

        if self.max_downloaders == 0 {
            return Err(CacheError::Config(
                "max_downloaders must be positive".to_owned(),
            ));
        }

        // Otherwise background fetches could never be dispatched.
        if self.priority_downloaders >= self.max_downloaders {
            return Err(CacheError::Config(format!(
                "priority_downloaders ({}) must be lower than max_downloaders ({})",
                self.priority_downloaders, self.max_downloaders
            )));
        }

        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("cache"),
            resume: true,
            max_downloaders: 20,
            priority_downloaders: 2,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            read_ahead: 0,
        }
    }
}
