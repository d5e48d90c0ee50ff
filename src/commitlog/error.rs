use crate::commitlog::Index;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Local IO failure: {0}")]
    Io(#[from] io::Error),

    // Fatal for the node. It must not vote or replicate until repaired or resynced.
    #[error("Persisted data is corrupt: {0}")]
    Corruption(String),

    #[error("Log entry {0:?} has been compacted into a snapshot")]
    Compacted(Index),
}

impl From<prost::DecodeError> for StorageError {
    fn from(e: prost::DecodeError) -> Self {
        StorageError::Corruption(format!("undecodable record: {}", e))
    }
}

impl From<prost::EncodeError> for StorageError {
    fn from(e: prost::EncodeError) -> Self {
        StorageError::Io(io::Error::new(io::ErrorKind::Other, e))
    }
}
