use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    Client, StatusCode, Url,
};
use serde_json::{Map, Value};

use crate::{
    catalog::MediaRecord,
    error::{CacheError, CacheResult, ProviderError},
    interval::ByteRange,
    SourceTag,
};

/// An upstream source of media bytes.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Fetches exactly the bytes of the half-open `range` of the media.
    async fn download(&self, record: &MediaRecord, range: ByteRange)
        -> Result<Bytes, ProviderError>;

    /// Looks up the requested metadata `fields`. Fields the provider does not know are omitted.
    async fn get_metadata(
        &self,
        record: &MediaRecord,
        fields: &[&str],
    ) -> Result<Map<String, Value>, ProviderError>;
}

/// Table of content providers keyed by the source tag stored in each [`MediaRecord`].
///
/// Built once at startup and handed to the [`crate::MediaCache`].
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<SourceTag, Arc<dyn ContentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_provider<S, P>(mut self, source: S, provider: P) -> Self
    where
        S: Into<SourceTag>,
        P: ContentProvider + 'static,
    {
        self.register(source, Arc::new(provider));
        self
    }

    pub fn register<S>(&mut self, source: S, provider: Arc<dyn ContentProvider>)
    where
        S: Into<SourceTag>,
    {
        self.providers.insert(source.into(), provider);
    }

    pub fn resolve(&self, source: &str) -> CacheResult<Arc<dyn ContentProvider>> {
        self.providers
            .get(source)
            .cloned()
            .ok_or_else(|| CacheError::UnknownSource(source.to_owned()))
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceTag> {
        self.providers.keys()
    }
}

impl Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("sources", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Provider for media served over plain HTTP with `Range` support, where the record locator is
/// the media URL.
#[derive(Debug, Clone, Default)]
pub struct HttpProvider {
    http_client: Client,
    /// Sent with every request, e.g. `Referer` or `Cookie` headers the host insists on.
    headers: HeaderMap,
}

impl HttpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http_client: Client) -> Self {
        Self {
            http_client,
            headers: HeaderMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn url(record: &MediaRecord) -> Result<Url, ProviderError> {
        record
            .locator
            .parse()
            .map_err(|_| ProviderError::Locator(record.locator.clone()))
    }

    /// HTTP ranges are inclusive on both ends.
    fn range_header(range: &ByteRange) -> String {
        format!("bytes={}-{}", range.start, range.end - 1)
    }

    /// Total size from a `Content-Range: bytes 0-0/1234` header.
    fn total_from_content_range(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(CONTENT_RANGE)?
            .to_str()
            .ok()?
            .rsplit_once('/')?
            .1
            .trim()
            .parse()
            .ok()
    }

    fn content_length(headers: &HeaderMap) -> Option<u64> {
        headers.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
    }
}

#[async_trait]
impl ContentProvider for HttpProvider {
    #[tracing::instrument(skip(self, record), fields(media_id = %record.id), err(Debug))]
    async fn download(
        &self,
        record: &MediaRecord,
        range: ByteRange,
    ) -> Result<Bytes, ProviderError> {
        let expected = range.end - range.start;

        if expected == 0 {
            return Ok(Bytes::new());
        }

        let response = self
            .http_client
            .get(Self::url(record)?)
            .headers(self.headers.clone())
            .header(RANGE, Self::range_header(&range))
            .send()
            .await?;

        let status = response.status();

        // A plain 200 means the host ignored the range, which only works out when we asked for
        // the beginning anyway.
        match status {
            StatusCode::PARTIAL_CONTENT => (),
            StatusCode::OK if range.start == 0 => (),
            status => return Err(ProviderError::Status(status)),
        }

        let mut body = response.bytes().await?;
        let received = body.len() as u64;

        if received < expected {
            return Err(ProviderError::ShortBody { expected, received });
        }

        #[allow(clippy::cast_possible_truncation)]
        body.truncate(expected as usize);

        Ok(body)
    }

    #[tracing::instrument(skip(self, record), fields(media_id = %record.id), err(Debug))]
    async fn get_metadata(
        &self,
        record: &MediaRecord,
        fields: &[&str],
    ) -> Result<Map<String, Value>, ProviderError> {
        let mut metadata = Map::new();

        if !fields.contains(&MediaRecord::SIZE_FIELD) {
            return Ok(metadata);
        }

        // Probing the first byte works on hosts that refuse HEAD requests.
        let response = self
            .http_client
            .get(Self::url(record)?)
            .headers(self.headers.clone())
            .header(RANGE, Self::range_header(&(0..1)))
            .send()
            .await?;

        let size = match response.status() {
            StatusCode::PARTIAL_CONTENT => Self::total_from_content_range(response.headers()),
            StatusCode::OK => Self::content_length(response.headers()),
            status => return Err(ProviderError::Status(status)),
        };

        if let Some(size) = size {
            metadata.insert(MediaRecord::SIZE_FIELD.to_owned(), size.into());
        }

        Ok(metadata)
    }
}
