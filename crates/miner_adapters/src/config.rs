//! Miner launch configuration and its validation.
//!
//! Validation runs at the supervisor boundary before any process is spawned;
//! nothing in this module touches the filesystem or the network.

use crate::{MinerError, Result};
use serde::{Deserialize, Serialize};

/// Characters rejected in pool URLs, wallets and extra CLI args. The config
/// ends up on a command line and inside a generated config file, so shell
/// metacharacters are refused outright instead of escaped.
const FORBIDDEN_CHARS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r', '\\', '\'', '"', '!',
];

pub const MAX_WALLET_LEN: usize = 256;
pub const MAX_CLI_ARGS_LEN: usize = 1024;
pub const MAX_THREADS: u32 = 1024;

/// GPU backend section. Backends are enabled only with explicit device
/// selection; there is no auto-pick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Separate pool for the GPU backend; empty means "reuse none".
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub opencl: bool,
    #[serde(default)]
    pub cuda: bool,
    /// Comma-separated device indices, e.g. "0,1".
    #[serde(default)]
    pub devices: String,
    #[serde(default)]
    pub intensity: u32,
    #[serde(default)]
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerConfig {
    pub pool_url: String,
    pub wallet: String,
    #[serde(default)]
    pub algorithm: String,
    /// 0 lets the miner pick based on available cores.
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub max_threads_hint: u32,
    #[serde(default)]
    pub cpu_priority: u32,
    #[serde(default)]
    pub intensity: u32,
    #[serde(default = "default_donate_level")]
    pub donate_level: u32,
    /// Extra args appended verbatim after validation.
    #[serde(default)]
    pub cli_args: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default)]
    pub pause_on_active: bool,
    #[serde(default)]
    pub pause_on_battery: bool,
    #[serde(default)]
    pub gpu: Option<GpuConfig>,
    /// 0 means "allocate one for me".
    #[serde(default)]
    pub api_port: u16,
}

fn default_donate_level() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            pool_url: String::new(),
            wallet: String::new(),
            algorithm: String::new(),
            threads: 0,
            max_threads_hint: 0,
            cpu_priority: 0,
            intensity: 0,
            donate_level: default_donate_level(),
            cli_args: String::new(),
            tls: false,
            keepalive: true,
            pause_on_active: false,
            pause_on_battery: false,
            gpu: None,
            api_port: 0,
        }
    }
}

impl MinerConfig {
    /// Thread count to mine with: the explicit setting, otherwise half
    /// the available cores, at least one.
    pub fn effective_threads(&self) -> u32 {
        if self.threads > 0 {
            self.threads
        } else {
            ((num_cpus::get() as u32) / 2).max(1)
        }
    }

    /// Reject anything that cannot safely reach a command line, a config
    /// file, or an instance name. Enforced before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.pool_url.is_empty() {
            return Err(MinerError::InvalidConfig("pool URL is required".into()));
        }
        check_forbidden("pool URL", &self.pool_url)?;
        check_forbidden("wallet", &self.wallet)?;
        check_forbidden("CLI args", &self.cli_args)?;

        if self.wallet.len() > MAX_WALLET_LEN {
            return Err(MinerError::InvalidConfig(format!(
                "wallet exceeds {} characters",
                MAX_WALLET_LEN
            )));
        }
        if self.cli_args.len() > MAX_CLI_ARGS_LEN {
            return Err(MinerError::InvalidConfig(format!(
                "CLI args exceed {} characters",
                MAX_CLI_ARGS_LEN
            )));
        }
        if self.threads > MAX_THREADS {
            return Err(MinerError::InvalidConfig(format!(
                "threads must be 0-{}",
                MAX_THREADS
            )));
        }
        if self.intensity > 100 {
            return Err(MinerError::InvalidConfig("intensity must be 0-100".into()));
        }
        if self.donate_level > 100 {
            return Err(MinerError::InvalidConfig("donate level must be 0-100".into()));
        }
        if !self.algorithm.chars().all(is_algo_char) {
            return Err(MinerError::InvalidConfig(format!(
                "algorithm contains invalid characters: {}",
                self.algorithm
            )));
        }
        if let Some(gpu) = &self.gpu {
            check_forbidden("GPU pool URL", &gpu.pool)?;
            if gpu.intensity > 100 {
                return Err(MinerError::InvalidConfig(
                    "GPU intensity must be 0-100".into(),
                ));
            }
        }
        validate_api_port(self.api_port)?;
        Ok(())
    }
}

/// 0 (auto) or a non-privileged port.
pub fn validate_api_port(port: u16) -> Result<()> {
    if port != 0 && port < 1024 {
        return Err(MinerError::InvalidConfig(format!(
            "API port must be 0 or 1024-65535, got {}",
            port
        )));
    }
    Ok(())
}

fn check_forbidden(field: &str, value: &str) -> Result<()> {
    if let Some(c) = value.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(MinerError::InvalidConfig(format!(
            "{} contains forbidden character {:?}",
            field, c
        )));
    }
    Ok(())
}

fn is_algo_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '-'
}

/// Replace anything outside `[A-Za-z0-9_/-]` with `_`.
pub fn sanitize_suffix(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_algo_char(c) { c } else { '_' })
        .collect()
}

/// `<type>-<sanitized algorithm>`, or a time-based suffix when the
/// algorithm is empty.
pub fn derive_instance_name(kind: &str, algorithm: &str, now_unix: u64) -> String {
    if algorithm.is_empty() {
        format!("{}-{}", kind, now_unix)
    } else {
        format!("{}-{}", kind, sanitize_suffix(algorithm))
    }
}
