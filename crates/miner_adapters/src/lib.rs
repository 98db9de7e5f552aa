mod breaker;
mod config;
mod factory;
mod history;
mod logbuf;
mod ports;
mod process;
mod registry;
mod simulated;
mod ttminer;
mod xmrig;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::{
    derive_instance_name, sanitize_suffix, validate_api_port, GpuConfig, MinerConfig,
    MAX_CLI_ARGS_LEN, MAX_THREADS, MAX_WALLET_LEN,
};
pub use factory::MinerFactory;
pub use history::{
    HashrateHistory, HIGH_RES_INTERVAL_SECS, HIGH_RES_WINDOW_SECS, LOW_RES_INTERVAL_SECS,
    LOW_RES_WINDOW_SECS,
};
pub use logbuf::{LogBuffer, LogsPage, DEFAULT_MAX_LINES};
pub use ports::allocate_port;
pub use process::{install_base, ApiEndpoint, MinerState, GRACE_PERIOD, STDIN_TIMEOUT};
pub use registry::VersionRegistry;
pub use simulated::SimulatedMiner;
pub use ttminer::TtMiner;
pub use xmrig::XmrigMiner;

use async_trait::async_trait;
use openminerd_store::HashratePoint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persistence error: {0}")]
    Store(#[from] openminerd_store::StoreError),
    #[error("{kind} is not installed (searched: {})", .searched.join(", "))]
    NotInstalled { kind: String, searched: Vec<String> },
    #[error("miner already running")]
    AlreadyRunning,
    #[error("miner not running")]
    NotRunning,
    #[error("miner did not accept stdin within the deadline")]
    Unresponsive,
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("stop failed: {0}")]
    StopFailed(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported miner type: {0}")]
    UnsupportedType(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("upstream circuit is open")]
    CircuitOpen,
}

pub type Result<T> = std::result::Result<T, MinerError>;

/// Canonical stats shape every miner variant maps its own schema into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub hashrate: f64,
    pub shares: u64,
    pub rejected: u64,
    pub uptime: u64,
    pub algorithm: String,
    pub avg_difficulty: f64,
    pub diff_current: f64,
}

/// Capability set of a supervised miner instance.
///
/// The supervisor only ever talks to this trait; new miner variants plug
/// in through the factory without the supervisor enumerating them.
#[async_trait]
pub trait Miner: Send + Sync {
    fn kind(&self) -> &'static str;
    fn name(&self) -> String;
    fn set_name(&self, name: &str);
    fn version(&self) -> Option<String>;
    fn install_path(&self) -> PathBuf;
    fn binary_path(&self) -> Option<PathBuf>;
    fn api(&self) -> ApiEndpoint;
    fn set_api_port(&self, port: u16);
    fn is_running(&self) -> bool;
    fn history(&self) -> Arc<HashrateHistory>;
    fn log_buffer(&self) -> Arc<LogBuffer>;

    /// Whether a usable binary is present (and, when a pinned checksum
    /// exists, verified).
    async fn check_installation(&self) -> Result<bool>;

    /// Latest upstream release, breaker-guarded; may serve a cached value.
    async fn latest_version(&self) -> Result<String>;

    /// Resolve the latest version and prepare the versioned install
    /// directory. Binary download/extraction is the installer's job.
    async fn install(&self) -> Result<PathBuf>;

    /// Remove the miner's on-disk install directories.
    async fn uninstall(&self) -> Result<()>;

    async fn start(&self, config: &MinerConfig) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Fetch and canonicalize stats from the miner's HTTP API. `deadline`
    /// caps the call; implementations clamp it to 5 s.
    async fn get_stats(&self, deadline: Duration) -> Result<PerformanceMetrics>;

    async fn write_stdin(&self, line: &str) -> Result<()>;
}

/// Convenience: the most recent sample in an instance's history.
pub fn last_point(history: &HashrateHistory) -> Option<HashratePoint> {
    history.snapshot().last().copied()
}
