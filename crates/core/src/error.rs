//! Supervisor-boundary error taxonomy.
//!
//! Every error crossing the core's surface maps to one of these kinds;
//! the REST adapter renders them through [`CoreError::to_wire`].

use openminerd_miner_adapters::MinerError;
use openminerd_store::StoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not running: {0}")]
    NotRunning(String),
    #[error("install failed: {0}")]
    InstallFailed(String),
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("stop failed: {0}")]
    StopFailed(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported miner type: {0}")]
    UnsupportedType(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("profile already exists: {0}")]
    ProfileExists(String),
    #[error("upstream circuit is open")]
    CircuitOpen,
    #[error("rate limited")]
    RateLimited,
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Wire shape consumed by the REST adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<&'static str>,
    pub retryable: bool,
    pub http_status: u16,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::InstallFailed(_) => "INSTALL_FAILED",
            Self::StartFailed(_) => "START_FAILED",
            Self::StopFailed(_) => "STOP_FAILED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Self::ProfileExists(_) => "PROFILE_EXISTS",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::Timeout(_)
                | Self::ServiceUnavailable(_)
                | Self::Persistence(_)
                | Self::InstallFailed(_)
                | Self::StartFailed(_)
                | Self::StopFailed(_)
                | Self::Internal(_)
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::ProfileNotFound(_) => 404,
            Self::AlreadyExists(_) | Self::ProfileExists(_) => 409,
            Self::NotRunning(_) => 409,
            Self::InvalidConfig(_) | Self::InvalidInput(_) | Self::UnsupportedType(_) => 400,
            Self::RateLimited => 429,
            Self::Cancelled => 499,
            Self::Timeout(_) => 504,
            Self::CircuitOpen | Self::ServiceUnavailable(_) | Self::ConnectionFailed(_) => 503,
            _ => 500,
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::RateLimited => Some("slow down and retry after a short delay"),
            Self::CircuitOpen => Some("the upstream registry is failing; retry later"),
            Self::InstallFailed(_) => Some("install the miner binary or adjust the install path"),
            Self::UnsupportedType(_) => Some("list supported types and pick one of them"),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: None,
            suggestion: self.suggestion(),
            retryable: self.retryable(),
            http_status: self.http_status(),
        }
    }
}

impl From<MinerError> for CoreError {
    fn from(e: MinerError) -> Self {
        match e {
            MinerError::NotInstalled { .. } => Self::InstallFailed(e.to_string()),
            MinerError::AlreadyRunning => Self::StartFailed(e.to_string()),
            MinerError::NotRunning => Self::NotRunning(e.to_string()),
            MinerError::Unresponsive => Self::Timeout(e.to_string()),
            MinerError::StartFailed(m) => Self::StartFailed(m),
            MinerError::StopFailed(m) => Self::StopFailed(m),
            MinerError::InvalidConfig(m) => Self::InvalidConfig(m),
            MinerError::UnsupportedType(m) => Self::UnsupportedType(m),
            MinerError::ConnectionFailed(m) => Self::ConnectionFailed(m),
            MinerError::Timeout(m) => Self::Timeout(m),
            MinerError::CircuitOpen => Self::CircuitOpen,
            MinerError::Store(e) => Self::Persistence(e.to_string()),
            MinerError::Io(e) => Self::Internal(e.to_string()),
            MinerError::Json(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}
