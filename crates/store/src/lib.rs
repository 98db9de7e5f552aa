mod history_store;
mod repository;

pub use history_store::{HistoryStore, InstanceStats, NoopHistoryStore, Resolution};
pub use repository::{write_atomic, JsonRepository};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// An `update` closure refused the mutation; nothing was written.
    #[error("{0}")]
    Rejected(String),
    #[error("store closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One hashrate sample. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashratePoint {
    /// Unix seconds.
    pub timestamp: u64,
    pub hashrate: u64,
}

impl HashratePoint {
    pub fn new(timestamp: u64, hashrate: u64) -> Self {
        Self { timestamp, hashrate }
    }
}
