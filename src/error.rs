use std::{io::Error as IoError, num::ParseIntError, ops::Range};

use reqwest::{Error as ReqError, StatusCode};
use serde_json::Error as JsonError;
use thiserror::Error as ThisError;
use tokio::task::JoinError;

use crate::MediaId;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, ThisError)]
pub enum CacheError {
    #[error("media not found: {0}")]
    MediaNotFound(MediaId),
    #[error("invalid media ID {0:?}: must be 1 to {max} bytes long", max = crate::MediaRecord::MAX_ID_LEN)]
    InvalidMediaId(MediaId),
    #[error("invalid byte range {start}..{end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("byte range {range:?} of media {media_id} is not fully cached")]
    IncompleteRange {
        media_id: MediaId,
        range: Range<u64>,
    },
    #[error("upstream fetch error: {0}")]
    UpstreamFetch(#[from] ProviderError),
    #[error("byte range {range:?} of media {media_id} overlaps a cached chunk")]
    DuplicateRange {
        media_id: MediaId,
        range: Range<u64>,
    },
    #[error("no content provider registered for source {0:?}")]
    UnknownSource(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("download scheduler is not running")]
    SchedulerStopped,
    #[error("fetch task joining error: {0}")]
    JoinTask(#[from] JoinError),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("media catalog error: {0}")]
    Catalog(#[from] JsonError),
    #[error("chunk file error: {0}")]
    ChunkFile(#[from] ChunkFileError),
}

#[derive(Debug, ThisError)]
pub enum ProviderError {
    #[error("download request error: {0}")]
    Request(#[from] ReqError),
    #[error("upstream responded with status {0}")]
    Status(StatusCode),
    #[error("upstream returned {received} bytes, expected {expected}")]
    ShortBody { expected: u64, received: u64 },
    #[error("invalid locator {0:?}")]
    Locator(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, ThisError)]
pub enum ChunkFileError {
    #[error("invalid chunk file name: {0}")]
    InvalidFileName(String),
    #[error("media ID error: {0}")]
    MediaId(#[source] InvalidHexIdError),
    #[error("error parsing chunk byte range: {0}")]
    ByteRange(#[source] ParseIntError),
}

#[derive(Debug, ThisError)]
#[error("invalid HEX ID {id}")]
pub struct InvalidHexIdError {
    id: String,
    #[source]
    kind: IdErrorKind,
}

impl InvalidHexIdError {
    pub(crate) fn odd_length(id: String) -> Self {
        Self {
            id,
            kind: IdErrorKind::OddLength,
        }
    }

    pub(crate) fn hex_byte(id: String, error: ParseIntError) -> Self {
        Self {
            id,
            kind: IdErrorKind::HexByte(error),
        }
    }

    pub(crate) fn utf8(id: String) -> Self {
        Self {
            id,
            kind: IdErrorKind::Utf8,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum IdErrorKind {
    #[error("ID has an odd number of HEX digits")]
    OddLength,
    #[error("HEX byte parsing error: {0}")]
    HexByte(#[source] ParseIntError),
    #[error("decoded ID is not valid UTF-8")]
    Utf8,
}
