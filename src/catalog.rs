use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{
    error::{CacheError, CacheResult},
    MediaId, SourceTag,
};

/// What the cache knows about a piece of media: where it comes from and any metadata gathered
/// so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    /// Tag of the [`crate::ContentProvider`] serving this media.
    pub source: SourceTag,
    /// Upstream locator understood by the provider, usually a URL.
    pub locator: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MediaRecord {
    pub const SIZE_FIELD: &'static str = "size";
    /// Chunk file names carry the hex encoded ID, and must stay under the usual 255 bytes limit.
    pub const MAX_ID_LEN: usize = 100;

    pub fn new<I, S, L>(id: I, source: S, locator: L) -> Self
    where
        I: Into<MediaId>,
        S: Into<SourceTag>,
        L: Into<String>,
    {
        Self {
            id: id.into(),
            source: source.into(),
            locator: locator.into(),
            metadata: Map::new(),
        }
    }

    /// The content size, if it was already looked up.
    pub fn size(&self) -> Option<u64> {
        self.metadata.get(Self::SIZE_FIELD).and_then(Value::as_u64)
    }
}

/// Media records keyed by ID, persisted as a JSON file.
#[derive(Debug)]
pub struct MediaCatalog {
    path: Arc<Path>,
    records: RwLock<HashMap<MediaId, MediaRecord>>,
    /// Serializes file writes so an older snapshot never overwrites a newer one.
    persist_lock: Mutex<()>,
}

impl MediaCatalog {
    pub const CATALOG_FILE: &'static str = "catalog.json";

    #[tracing::instrument(fields(base_path = format_args!("{}", base_path.as_ref().display())), err(Debug))]
    pub async fn open<P>(base_path: &P, resume: bool) -> CacheResult<Self>
    where
        P: AsRef<Path>,
    {
        tokio::fs::create_dir_all(base_path).await?;

        let path: Arc<Path> = base_path.as_ref().join(Self::CATALOG_FILE).into();
        let mut records = HashMap::new();

        if resume && tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read(&path).await?;
            let stored: Vec<MediaRecord> = serde_json::from_slice(&raw)?;
            records.extend(stored.into_iter().map(|r| (r.id.clone(), r)));

            tracing::info!(records = records.len(), "restored media catalog");
        }

        Ok(Self {
            path,
            records: RwLock::new(records),
            persist_lock: Mutex::new(()),
        })
    }

    /// Adds or replaces a media record.
    #[tracing::instrument(skip(self), fields(media_id = %record.id), err(Debug))]
    pub async fn register(&self, record: MediaRecord) -> CacheResult<()> {
        if record.id.is_empty() || record.id.len() > MediaRecord::MAX_ID_LEN {
            return Err(CacheError::InvalidMediaId(record.id));
        }

        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record);

        self.persist().await
    }

    pub fn get(&self, media_id: &str) -> Option<MediaRecord> {
        self.records.read().unwrap().get(media_id).cloned()
    }

    pub fn contains(&self, media_id: &str) -> bool {
        self.records.read().unwrap().contains_key(media_id)
    }

    pub fn list(&self) -> Vec<MediaId> {
        self.records.read().unwrap().keys().cloned().collect()
    }

    pub fn cached_size(&self, media_id: &str) -> Option<u64> {
        self.records
            .read()
            .unwrap()
            .get(media_id)
            .and_then(MediaRecord::size)
    }

    /// Records the content size of `media_id` in its metadata.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn store_size(&self, media_id: &str, size: u64) -> CacheResult<()> {
        {
            let mut records = self.records.write().unwrap();
            let record = records
                .get_mut(media_id)
                .ok_or_else(|| CacheError::MediaNotFound(media_id.into()))?;

            record
                .metadata
                .insert(MediaRecord::SIZE_FIELD.to_owned(), size.into());
        }

        self.persist().await
    }

    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn remove(&self, media_id: &str) -> CacheResult<Option<MediaRecord>> {
        let removed = self.records.write().unwrap().remove(media_id);

        if removed.is_some() {
            self.persist().await?;
        }

        Ok(removed)
    }

    /// Writes the catalog to a temporary file and renames it over the previous one.
    async fn persist(&self) -> CacheResult<()> {
        let _guard = self.persist_lock.lock().await;

        let raw = {
            let records = self.records.read().unwrap();
            let mut snapshot: Vec<_> = records.values().collect();
            snapshot.sort_by(|a, b| a.id.cmp(&b.id));
            serde_json::to_vec_pretty(&snapshot)?
        };

        let mut tmp_path = self.path.as_os_str().to_owned();
        tmp_path.push(".tmp");

        tokio::fs::write(&tmp_path, raw).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        Ok(())
    }
}
