use std::path::PathBuf;

use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum SegdlError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Failed to fetch playlist {url}: {reason}")]
    PlaylistFetch { url: String, reason: String },

    #[error("Invalid m3u8 file: {0}")]
    PlaylistParse(String),

    #[error("No variant stream found in master playlist {0}")]
    NoVariantFound(String),

    #[error("Failed to fetch segment {index}: {reason}")]
    SegmentFetch { index: u64, reason: String },

    #[error("Failed to decrypt segment {index}: {reason}")]
    Decryption { index: u64, reason: String },

    #[error("Failed to merge segments: {0}")]
    Merge(String),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Segment {index} of job {job_id} not found")]
    SegmentNotFound { job_id: JobId, index: u64 },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl SegdlError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether a segment worker should try the same request again.
    /// Only network-level failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SegmentFetch { .. } | Self::HttpError(_) | Self::RequestError(_)
        )
    }
}

pub type SegdlResult<T> = Result<T, SegdlError>;
