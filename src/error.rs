use reqwest::StatusCode;
use thiserror::Error;

/// Failure talking to the remote resource.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {} {}", .0.as_u16(), .0.canonical_reason().unwrap_or("Unknown"))]
    Status(StatusCode),

    #[error("{0}")]
    Protocol(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("cannot split an empty resource")]
    EmptyResource,

    #[error("segment count must be at least 1")]
    NoSegments,
}

/// Why a single segment could not be fetched and stored.
#[derive(Debug, Error)]
pub enum SegmentFailure {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to store segment buffer: {0}")]
    Store(#[source] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("size probe failed: {0}")]
    Probe(#[source] SourceError),

    #[error("size probe rejected: server returned {} {}", .0.as_u16(), .0.canonical_reason().unwrap_or("Unknown"))]
    Remote(StatusCode),

    #[error("server did not report a usable size: {0}")]
    SizeUnknown(String),

    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("segment #{index} failed: {cause}")]
    Fetch {
        index: usize,
        #[source]
        cause: SegmentFailure,
    },

    #[error("merge failed at segment #{index}: {cause}")]
    Merge {
        index: usize,
        #[source]
        cause: std::io::Error,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("fetch worker panicked: {0}")]
    Worker(String),
}

impl DownloadError {
    /// Index of the segment the failure belongs to, if any.
    pub fn segment(&self) -> Option<usize> {
        match self {
            DownloadError::Fetch { index, .. } | DownloadError::Merge { index, .. } => Some(*index),
            _ => None,
        }
    }
}
