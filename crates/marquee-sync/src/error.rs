use marquee_common::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote collection could not be read, so nothing was merged.
    #[error("Collection store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("Mirror IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Mirror Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid mirror snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("Unsupported mirror file version {0}")]
    UnsupportedMirrorVersion(u32),
}

pub type Result<T> = std::result::Result<T, SyncError>;
