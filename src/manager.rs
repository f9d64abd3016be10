use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    catalog::{MediaCatalog, MediaRecord},
    config::CacheConfig,
    error::{CacheError, CacheResult, ProviderError},
    interval::ByteRange,
    provider::ProviderRegistry,
    queue::{Completion, Priority, QueueItem},
    scheduler::{Command, Scheduler, WorkerLimits},
    store::RangeStore,
    MediaId,
};

/// Client handle of the media cache.
///
/// Cloning is cheap; every clone talks to the same download scheduler.
#[derive(Debug, Clone)]
pub struct MediaCache {
    config: Arc<CacheConfig>,
    store: RangeStore,
    catalog: Arc<MediaCatalog>,
    providers: Arc<ProviderRegistry>,
    commands: mpsc::UnboundedSender<Command>,
    /// Handle of the scheduler task, taken by [`MediaCache::stop`].
    scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MediaCache {
    /// Opens the range store and media catalog at the configured base path and starts the
    /// download scheduler.
    ///
    /// Must be called from within a Tokio runtime.
    #[tracing::instrument(skip(providers), err(Debug))]
    pub async fn new(config: CacheConfig, providers: ProviderRegistry) -> CacheResult<Self> {
        config.validate()?;

        let store = RangeStore::open(&config.base_path, config.resume).await?;
        let catalog = Arc::new(MediaCatalog::open(&config.base_path, config.resume).await?);
        let providers = Arc::new(providers);

        let limits = WorkerLimits {
            max_downloaders: config.max_downloaders,
            priority_downloaders: config.priority_downloaders,
        };

        let (commands, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(rx, limits, store.clone(), catalog.clone(), providers.clone());
        let scheduler = tokio::spawn(scheduler.run());

        Ok(Self {
            config: Arc::new(config),
            store,
            catalog,
            providers,
            commands,
            scheduler: Arc::new(Mutex::new(Some(scheduler))),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &RangeStore {
        &self.store
    }

    pub fn catalog(&self) -> &MediaCatalog {
        &self.catalog
    }

    /// Adds or replaces the record describing where a media is fetched from.
    pub async fn register_media(&self, record: MediaRecord) -> CacheResult<()> {
        self.catalog.register(record).await
    }

    /// Returns bytes `start..end` of the media, fetching whatever is not cached yet with the
    /// highest priority.
    ///
    /// Waits until every fragment of the range got fetched or failed. A range that could not be
    /// fetched completely results in [`CacheError::IncompleteRange`]. Pass `None` as `chunk_size`
    /// to use the configured one.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn request_range(
        &self,
        media_id: &str,
        start: u64,
        end: u64,
        chunk_size: Option<u64>,
    ) -> CacheResult<Bytes> {
        let range = Self::byte_range(start, end)?;
        let record = self.record(media_id)?;

        if range.is_empty() {
            return Ok(Bytes::new());
        }

        // Fully cached ranges need no round trip through a possibly saturated scheduler.
        if !self.store.covered(media_id, &range) {
            let (completion, done) = Completion::channel();
            let item = QueueItem::new(record.id.clone(), range.clone(), self.chunk_size(chunk_size))
                .with_completion(completion);

            self.send(Command::Enqueue {
                priority: Priority::Top,
                item,
            })?;

            done.await.map_err(|_| CacheError::SchedulerStopped)?;
        }

        match self.store.read(media_id, range.clone()).await {
            Err(CacheError::IncompleteRange { .. }) if self.commands.is_closed() => {
                Err(CacheError::SchedulerStopped)
            }
            Ok(data) => {
                self.read_ahead(&record, range.end);
                Ok(data)
            }
            Err(e) => Err(e),
        }
    }

    /// Queues `start..end` of the media for fetching without waiting for it.
    ///
    /// `priority` is usually [`Priority::Buffer`] for read-ahead or [`Priority::Regular`] for
    /// background warm-up.
    #[tracing::instrument(skip(self), err(Debug))]
    pub fn enqueue(
        &self,
        media_id: &str,
        start: u64,
        end: u64,
        chunk_size: Option<u64>,
        priority: Priority,
    ) -> CacheResult<()> {
        let range = Self::byte_range(start, end)?;
        let record = self.record(media_id)?;

        if range.is_empty() {
            return Ok(());
        }

        let item = QueueItem::new(record.id, range, self.chunk_size(chunk_size));
        self.send(Command::Enqueue { priority, item })
    }

    /// Total size of the media in bytes.
    ///
    /// Served from the media record when known, otherwise asked from the content provider and
    /// remembered in the record.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn get_content_size(&self, media_id: &str) -> CacheResult<u64> {
        let record = self.record(media_id)?;

        if let Some(size) = record.size() {
            return Ok(size);
        }

        let provider = self.providers.resolve(&record.source)?;
        let metadata = provider
            .get_metadata(&record, &[MediaRecord::SIZE_FIELD])
            .await?;

        let size = metadata
            .get(MediaRecord::SIZE_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ProviderError::Other(format!("provider reported no size for {media_id}"))
            })?;

        self.catalog.store_size(media_id, size).await?;

        Ok(size)
    }

    /// Queues the whole media for background fetching.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn warm_up(&self, media_id: &str) -> CacheResult<()> {
        let size = self.get_content_size(media_id).await?;
        self.enqueue(media_id, 0, size, None, Priority::Regular)
    }

    /// Drops every cached byte of the media. The media record stays.
    pub async fn purge_media(&self, media_id: &str) -> CacheResult<usize> {
        self.store.purge(media_id).await
    }

    /// Stops the download scheduler and waits for running fetches to finish.
    ///
    /// Queued requests are discarded; their callers get [`CacheError::SchedulerStopped`].
    #[allow(clippy::missing_panics_doc)]
    pub async fn stop(&self) {
        // The scheduler may already be gone, in which case there is nothing to stop.
        self.commands.send(Command::Stop).ok();

        let handle = self.scheduler.lock().unwrap().take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("error when waiting for the download scheduler: {e}");
            }
        }
    }

    fn record(&self, media_id: &str) -> CacheResult<MediaRecord> {
        self.catalog
            .get(media_id)
            .ok_or_else(|| CacheError::MediaNotFound(MediaId::from(media_id)))
    }

    fn byte_range(start: u64, end: u64) -> CacheResult<ByteRange> {
        if end < start {
            return Err(CacheError::InvalidRange { start, end });
        }

        Ok(start..end)
    }

    fn chunk_size(&self, chunk_size: Option<u64>) -> u64 {
        chunk_size.unwrap_or(self.config.chunk_size).max(1)
    }

    fn send(&self, command: Command) -> CacheResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CacheError::SchedulerStopped)
    }

    /// Prefetches the bytes following a served range on the `buffer` lane.
    ///
    /// Only done when the media size is known, so that nothing past the end gets requested.
    fn read_ahead(&self, record: &MediaRecord, from: u64) {
        if self.config.read_ahead == 0 {
            return;
        }

        let Some(size) = self.catalog.cached_size(&record.id) else {
            return;
        };

        let to = from.saturating_add(self.config.read_ahead).min(size);

        if from >= to {
            return;
        }

        let item = QueueItem::new(record.id.clone(), from..to, self.config.chunk_size);

        if self
            .send(Command::Enqueue {
                priority: Priority::Buffer,
                item,
            })
            .is_err()
        {
            tracing::debug!("scheduler stopped, skipping read-ahead");
        }
    }
}
