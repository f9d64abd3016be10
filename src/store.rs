use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt::UpperHex,
    io::Result as IoResult,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use bytes::{Bytes, BytesMut};
use rangemap::RangeMap;

use crate::{
    error::{CacheError, CacheResult, ChunkFileError, InvalidHexIdError},
    interval::{self, ByteRange},
    MediaId,
};

/// Location of a cached chunk on disk.
///
/// Every chunk has its own file, so slots of neighbouring chunks never compare equal and the
/// [`RangeMap`] never coalesces them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkSlot {
    path: Arc<Path>,
}

/// A contiguous run of bytes of some media, persisted as a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedChunk {
    media_id: MediaId,
    range: ByteRange,
    path: Arc<Path>,
}

impl CachedChunk {
    pub fn media_id(&self) -> &MediaId {
        &self.media_id
    }

    pub fn range(&self) -> &ByteRange {
        &self.range
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the chunk bytes from disk.
    pub async fn data(&self) -> IoResult<Bytes> {
        tokio::fs::read(&self.path).await.map(Bytes::from)
    }
}

/// Persistent cache of fetched byte ranges.
///
/// Chunks of the same media never overlap. Nothing is evicted automatically; chunks only go
/// away through [`RangeStore::purge`].
#[derive(Debug, Clone)]
pub struct RangeStore {
    /// Directory holding one file per chunk.
    chunks_path: Arc<Path>,
    /// Per-media index of the chunks on disk.
    index: Arc<RwLock<HashMap<MediaId, RangeMap<u64, ChunkSlot>>>>,
}

impl RangeStore {
    pub const CHUNKS_DIR: &'static str = "chunks";
    pub const FILENAME_PART_SEPARATOR: &'static str = "_";
    pub const DELETE_CHUNK_MARKER: &'static str = "DELETE";
    pub const INCOMPLETE_CHUNK_MARKER: &'static str = "INCOMPLETE";

    /// Opens the store rooted at `base_path`, creating the chunk directory if needed.
    ///
    /// With `resume` set, chunks left on disk by a previous instance are indexed again, otherwise
    /// they are deleted.
    #[tracing::instrument(fields(base_path = format_args!("{}", base_path.as_ref().display())), err(Debug))]
    pub async fn open<P>(base_path: &P, resume: bool) -> CacheResult<Self>
    where
        P: AsRef<Path>,
    {
        let chunks_path: Arc<Path> = base_path.as_ref().join(Self::CHUNKS_DIR).into();
        tokio::fs::create_dir_all(&chunks_path).await?;

        let mut store = Self {
            chunks_path,
            index: Arc::default(),
        };

        if resume {
            store.restore().await?;
        } else {
            store.discard().await?;
        }

        Ok(store)
    }

    /// Rebuilds the index from the chunk files found on disk.
    #[tracing::instrument(skip(self), err(Debug))]
    async fn restore(&mut self) -> CacheResult<()> {
        tracing::info!(
            chunks_path = format_args!("{}", self.chunks_path.display()),
            "attempting to restore cached ranges"
        );

        let mut entries = tokio::fs::read_dir(&self.chunks_path).await?;
        let mut restored = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
                tracing::warn!(file = format_args!("{}", path.display()), "file is not a chunk");
                continue;
            };

            let parsed = match ChunkFileName::parse(file_name) {
                Ok(parsed) => parsed,
                // Deleting an unknown file is too extreme of a measure, so leave it for
                // inspection.
                Err(e) => {
                    tracing::warn!(file = format_args!("{}", path.display()), "file is not a chunk: {e}");
                    continue;
                }
            };

            // Leftovers of an interrupted write or purge.
            if parsed.marker.is_some() {
                tracing::info!("deleting stale chunk file: {}", path.display());
                tokio::fs::remove_file(&path).await?;
                continue;
            }

            let ChunkFileName {
                media_id, range, ..
            } = parsed;

            let mut index = self.index.write().unwrap();
            let chunks = index.entry(media_id.clone()).or_default();

            if range.is_empty() || chunks.overlaps(&range) {
                tracing::warn!(%media_id, ?range, "skipping chunk overlapping a restored chunk");
                continue;
            }

            tracing::debug!(%media_id, ?range, "tracking chunk");
            chunks.insert(range, ChunkSlot { path: path.into() });
            drop(index);
            restored += 1;
        }

        tracing::info!(restored, "restored cached ranges");

        Ok(())
    }

    /// Deletes every chunk file left on disk, so that none of them resurfaces on a later resume.
    #[tracing::instrument(skip(self), err(Debug))]
    async fn discard(&self) -> CacheResult<()> {
        let mut entries = tokio::fs::read_dir(&self.chunks_path).await?;
        let mut discarded = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let Some(parsed) = path
                .file_name()
                .and_then(OsStr::to_str)
                .and_then(|name| ChunkFileName::parse(name).ok())
            else {
                tracing::warn!(file = format_args!("{}", path.display()), "file is not a chunk");
                continue;
            };

            if parsed.marker.is_some() {
                tokio::fs::remove_file(&path).await?;
            } else {
                Self::delete_chunk_file(&path).await?;
            }

            discarded += 1;
        }

        tracing::info!(discarded, "discarded previous cached ranges");

        Ok(())
    }

    /// Marks the file for deletion by renaming it first, which is atomic on the same filesystem,
    /// so that an interrupted deletion is finished by the next [`RangeStore::open`].
    async fn delete_chunk_file(path: &Path) -> IoResult<()> {
        let mut marked = path.as_os_str().to_owned();
        marked.push(Self::FILENAME_PART_SEPARATOR);
        marked.push(Self::DELETE_CHUNK_MARKER);

        tokio::fs::rename(path, &marked).await?;
        tokio::fs::remove_file(marked).await
    }

    /// Persists `data` as the bytes of `range` of `media_id`.
    ///
    /// Fails with [`CacheError::DuplicateRange`] if the range overlaps a chunk already stored for
    /// the same media.
    #[tracing::instrument(skip(self, data), fields(len = data.len()), err(Debug))]
    pub async fn insert(
        &self,
        media_id: &MediaId,
        range: ByteRange,
        data: Bytes,
    ) -> CacheResult<CachedChunk> {
        if range.is_empty() || data.len() as u64 != range.end - range.start {
            return Err(CacheError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }

        self.ensure_vacant(media_id, &range)?;

        let path: Arc<Path> = self
            .chunks_path
            .join(ChunkFileName::format(media_id, &range, None))
            .into();
        let tmp_path = self.chunks_path.join(ChunkFileName::format(
            media_id,
            &range,
            Some(Self::INCOMPLETE_CHUNK_MARKER),
        ));

        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        // Another writer may have raced us between the check and the rename.
        let res = {
            let mut index = self.index.write().unwrap();
            let chunks = index.entry(media_id.clone()).or_default();

            if chunks.overlaps(&range) {
                Err(CacheError::DuplicateRange {
                    media_id: media_id.clone(),
                    range: range.clone(),
                })
            } else {
                chunks.insert(range.clone(), ChunkSlot { path: path.clone() });
                Ok(())
            }
        };

        if let Err(e) = res {
            tokio::fs::remove_file(&path).await?;
            return Err(e);
        }

        tracing::debug!("cached chunk");

        Ok(CachedChunk {
            media_id: media_id.clone(),
            range,
            path,
        })
    }

    fn ensure_vacant(&self, media_id: &MediaId, range: &ByteRange) -> CacheResult<()> {
        let index = self.index.read().unwrap();

        match index.get(media_id) {
            Some(chunks) if chunks.overlaps(range) => Err(CacheError::DuplicateRange {
                media_id: media_id.clone(),
                range: range.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// All chunks of `media_id` intersecting `range`, ordered by start.
    pub fn query_overlapping(&self, media_id: &str, range: &ByteRange) -> Vec<CachedChunk> {
        if range.is_empty() {
            return Vec::new();
        }

        let index = self.index.read().unwrap();

        let Some((media_id, chunks)) = index.get_key_value(media_id) else {
            return Vec::new();
        };

        chunks
            .overlapping(range)
            .map(|(range, slot)| CachedChunk {
                media_id: media_id.clone(),
                range: range.clone(),
                path: slot.path.clone(),
            })
            .collect()
    }

    /// Whether the union of cached chunks covers all of `range`.
    pub fn covered(&self, media_id: &str, range: &ByteRange) -> bool {
        let chunks = self.query_overlapping(media_id, range);
        interval::subtract(range, chunks.iter().map(CachedChunk::range)).is_empty()
    }

    /// Stitches `range` of `media_id` together from the cached chunks.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn read(&self, media_id: &str, range: ByteRange) -> CacheResult<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let incomplete = || CacheError::IncompleteRange {
            media_id: media_id.into(),
            range: range.clone(),
        };

        let chunks = self.query_overlapping(media_id, &range);

        if !interval::subtract(&range, chunks.iter().map(CachedChunk::range)).is_empty() {
            return Err(incomplete());
        }

        let mut buf = BytesMut::with_capacity(to_offset(range.end - range.start));

        for chunk in chunks {
            let data = chunk.data().await?;
            let from = to_offset(range.start.max(chunk.range.start) - chunk.range.start);
            let to = to_offset(range.end.min(chunk.range.end) - chunk.range.start);

            // The file got truncated behind our back.
            let Some(slice) = data.get(from..to) else {
                tracing::error!(path = format_args!("{}", chunk.path.display()), "chunk file is shorter than its range");
                return Err(incomplete());
            };

            buf.extend_from_slice(slice);
        }

        Ok(buf.freeze())
    }

    /// Media that have at least one cached chunk.
    pub fn list_media(&self) -> Vec<MediaId> {
        self.index
            .read()
            .unwrap()
            .iter()
            .filter(|(_, chunks)| !chunks.is_empty())
            .map(|(media_id, _)| media_id.clone())
            .collect()
    }

    /// Ranges of `media_id` currently cached, ordered by start.
    pub fn cached_ranges(&self, media_id: &str) -> Vec<ByteRange> {
        self.index
            .read()
            .unwrap()
            .get(media_id)
            .map(|chunks| chunks.iter().map(|(range, _)| range.clone()).collect())
            .unwrap_or_default()
    }

    /// Removes every chunk of `media_id` from the index and from disk.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn purge(&self, media_id: &str) -> CacheResult<usize> {
        let Some(chunks) = self.index.write().unwrap().remove(media_id) else {
            return Ok(0);
        };

        let mut purged = 0;

        for (_, slot) in chunks {
            Self::delete_chunk_file(&slot.path).await?;
            purged += 1;
        }

        tracing::info!(purged, "purged cached chunks");

        Ok(purged)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_offset(n: u64) -> usize {
    n as usize
}

/// Chunk file naming scheme: `{HEX media ID}_{start:X}_{end:X}[_{marker}]`.
#[derive(Debug)]
struct ChunkFileName {
    media_id: MediaId,
    range: ByteRange,
    marker: Option<String>,
}

impl ChunkFileName {
    fn format(media_id: &str, range: &ByteRange, marker: Option<&str>) -> PathBuf {
        let mut name = format!(
            "{media_id:X}{sep}{start:X}{sep}{end:X}",
            sep = RangeStore::FILENAME_PART_SEPARATOR,
            media_id = UpperHexStr(media_id),
            start = range.start,
            end = range.end,
        );

        if let Some(marker) = marker {
            name.push_str(RangeStore::FILENAME_PART_SEPARATOR);
            name.push_str(marker);
        }

        name.into()
    }

    fn parse(name: &str) -> Result<Self, ChunkFileError> {
        let mut parts = name.split(RangeStore::FILENAME_PART_SEPARATOR);
        let mut next_part_fn = || {
            parts
                .next()
                .ok_or_else(|| ChunkFileError::InvalidFileName(name.to_owned()))
        };

        let media_id = hex_to_media_id(next_part_fn()?).map_err(ChunkFileError::MediaId)?;
        let start = u64::from_str_radix(next_part_fn()?, 16).map_err(ChunkFileError::ByteRange)?;
        let end = u64::from_str_radix(next_part_fn()?, 16).map_err(ChunkFileError::ByteRange)?;

        let marker = match (parts.next(), parts.next()) {
            (None, None) => None,
            (Some(s), None)
                if s == RangeStore::DELETE_CHUNK_MARKER
                    || s == RangeStore::INCOMPLETE_CHUNK_MARKER =>
            {
                Some(s.to_owned())
            }
            _ => return Err(ChunkFileError::InvalidFileName(name.to_owned())),
        };

        Ok(Self {
            media_id,
            range: start..end,
            marker,
        })
    }
}

fn hex_to_media_id(s: &str) -> Result<MediaId, InvalidHexIdError> {
    if s.len() % 2 != 0 {
        return Err(InvalidHexIdError::odd_length(s.to_owned()));
    }

    let bytes = (0..s.len())
        .step_by(2)
        .map(|idx| {
            let hex = s
                .get(idx..idx + 2)
                .ok_or_else(|| InvalidHexIdError::odd_length(s.to_owned()))?;

            u8::from_str_radix(hex, 16).map_err(|e| InvalidHexIdError::hex_byte(s.to_owned(), e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    String::from_utf8(bytes)
        .map(MediaId::from)
        .map_err(|_| InvalidHexIdError::utf8(s.to_owned()))
}

struct UpperHexStr<'a>(&'a str);

impl UpperHex for UpperHexStr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.bytes() {
            write!(f, "{byte:02X}")?;
        }

        Ok(())
    }
}
