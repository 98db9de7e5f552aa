//! XMRig adapter: subprocess with an HTTP summary endpoint.

use crate::config::{sanitize_suffix, MinerConfig};
use crate::process::{find_binary, ApiEndpoint, ProcessCore};
use crate::registry::VersionRegistry;
use crate::{HashrateHistory, LogBuffer, Miner, MinerError, PerformanceMetrics, Result};
use async_trait::async_trait;
use openminerd_store::write_atomic;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

const KIND: &str = "xmrig";
const BIN_NAME: &str = "xmrig";
const STATS_CAP: Duration = Duration::from_secs(5);

pub struct XmrigMiner {
    core: Arc<ProcessCore>,
    registry: Arc<VersionRegistry>,
    client: reqwest::Client,
    install_base: PathBuf,
    config_base: PathBuf,
}

impl XmrigMiner {
    pub fn new(registry: Arc<VersionRegistry>, client: reqwest::Client) -> Self {
        let config_base = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("openminerd");
        Self::with_paths(registry, client, crate::process::install_base(), config_base)
    }

    /// Test seam: redirect install and config directories.
    pub fn with_paths(
        registry: Arc<VersionRegistry>,
        client: reqwest::Client,
        install_base: PathBuf,
        config_base: PathBuf,
    ) -> Self {
        Self {
            core: Arc::new(ProcessCore::new("xmrig")),
            registry,
            client,
            install_base,
            config_base,
        }
    }

    fn config_path(&self) -> PathBuf {
        let name = self.core.name();
        let file = if name.is_empty() {
            "xmrig.json".to_string()
        } else {
            format!("{}.json", sanitize_suffix(&name).replace('/', "_"))
        };
        self.config_base.join(KIND).join(file)
    }

    /// Generated config file, XMRig schema. GPU backends are emitted only
    /// with explicit device lists; there is no auto-pick.
    fn build_config(&self, config: &MinerConfig, api: &ApiEndpoint) -> serde_json::Value {
        let mut pools = vec![serde_json::json!({
            "url": config.pool_url,
            "user": config.wallet,
            "pass": "x",
            "keepalive": config.keepalive,
            "tls": config.tls,
            "algo": config.algorithm,
        })];

        let gpu = config.gpu.as_ref();
        let gpu_enabled = gpu.map(|g| g.enabled).unwrap_or(false);
        if let Some(g) = gpu {
            if g.enabled && !g.pool.is_empty() {
                pools.push(serde_json::json!({
                    "url": g.pool,
                    "user": config.wallet,
                    "pass": "x",
                    "keepalive": config.keepalive,
                    "tls": config.tls,
                    "algo": config.algorithm,
                }));
            }
        }

        let mut cpu = serde_json::json!({
            "enabled": true,
            "huge-pages": true,
        });
        if config.threads > 0 {
            cpu["threads"] = config.threads.into();
        }
        if config.max_threads_hint > 0 {
            cpu["max-threads-hint"] = config.max_threads_hint.into();
        }
        if config.cpu_priority > 0 {
            cpu["priority"] = config.cpu_priority.into();
        }

        let backend = |flag: bool| -> serde_json::Value {
            match gpu {
                Some(g) if gpu_enabled && flag && !g.devices.is_empty() => {
                    let mut v = serde_json::json!({
                        "enabled": true,
                        "devices": g.devices,
                    });
                    if g.intensity > 0 {
                        v["intensity"] = g.intensity.into();
                    }
                    if g.threads > 0 {
                        v["threads"] = g.threads.into();
                    }
                    v
                }
                _ => serde_json::json!({ "enabled": false }),
            }
        };

        serde_json::json!({
            "api": {
                "enabled": api.enabled,
                "listen": format!("{}:{}", api.host, api.port),
                "restricted": true,
            },
            "pools": pools,
            "cpu": cpu,
            "opencl": backend(gpu.map(|g| g.opencl).unwrap_or(false)),
            "cuda": backend(gpu.map(|g| g.cuda).unwrap_or(false)),
            "pause-on-active": config.pause_on_active,
            "pause-on-battery": config.pause_on_battery,
        })
    }

    fn build_args(
        &self,
        config: &MinerConfig,
        config_path: &PathBuf,
        api: &ApiEndpoint,
    ) -> Vec<String> {
        let mut args = vec!["-c".to_string(), config_path.display().to_string()];
        if api.enabled {
            args.push("--http-host".into());
            args.push(api.host.clone());
            args.push("--http-port".into());
            args.push(api.port.to_string());
        }
        args.push("-o".into());
        args.push(config.pool_url.clone());
        args.push("-u".into());
        args.push(config.wallet.clone());
        if config.threads > 0 {
            args.push("-t".into());
            args.push(config.threads.to_string());
        }
        if config.tls {
            args.push("--tls".into());
        }
        args.push("--no-huge-pages".into());
        args.push("--donate-level".into());
        args.push(config.donate_level.to_string());
        for extra in config.cli_args.split_whitespace() {
            args.push(extra.to_string());
        }
        args
    }
}

#[async_trait]
impl Miner for XmrigMiner {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> String {
        self.core.name()
    }

    fn set_name(&self, name: &str) {
        self.core.set_name(name);
    }

    fn version(&self) -> Option<String> {
        self.core.version()
    }

    fn install_path(&self) -> PathBuf {
        self.install_base.clone()
    }

    fn binary_path(&self) -> Option<PathBuf> {
        self.core.binary_path()
    }

    fn api(&self) -> ApiEndpoint {
        self.core.api()
    }

    fn set_api_port(&self, port: u16) {
        self.core.set_api_port(port);
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn history(&self) -> Arc<HashrateHistory> {
        self.core.history.clone()
    }

    fn log_buffer(&self) -> Arc<LogBuffer> {
        self.core.logs.clone()
    }

    async fn check_installation(&self) -> Result<bool> {
        let (bin, version) = match find_binary(KIND, BIN_NAME, &self.install_base) {
            Ok(found) => found,
            Err(MinerError::NotInstalled { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        match version {
            Some(v) => self.registry.verify_binary(KIND, &v, &bin).await,
            // PATH binaries carry no version to pin against.
            None => Ok(true),
        }
    }

    async fn latest_version(&self) -> Result<String> {
        self.registry.latest_version(KIND).await
    }

    async fn install(&self) -> Result<PathBuf> {
        let version = match self.registry.latest_version(KIND).await {
            Ok(v) => v,
            Err(e) => {
                let Some(pinned) = self.registry.recommended_version(KIND) else {
                    return Err(MinerError::StartFailed(format!(
                        "cannot resolve a version to install: {}",
                        e
                    )));
                };
                warn!("release lookup failed ({}), using pinned {}", e, pinned);
                pinned
            }
        };
        let dir = self.install_base.join(format!("{}-{}", KIND, version));
        tokio::fs::create_dir_all(&dir).await?;
        info!("prepared install directory {:?}", dir);
        Ok(dir)
    }

    async fn uninstall(&self) -> Result<()> {
        if !self.install_base.is_dir() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.install_base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&format!("{}-", KIND)) && entry.path().is_dir() {
                info!("removing {:?}", entry.path());
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn start(&self, config: &MinerConfig) -> Result<()> {
        self.core.begin_start()?;

        let result = async {
            let (binary, version) = match self.core.binary_path() {
                Some(known) => (known, self.core.version()),
                None => find_binary(KIND, BIN_NAME, &self.install_base)?,
            };

            let mut api = self.core.api();
            api.enabled = true;
            if config.api_port != 0 {
                crate::config::validate_api_port(config.api_port)?;
                api.port = config.api_port;
            } else if api.port == 0 {
                api.port = crate::ports::allocate_port()?;
            }

            let config_path = self.config_path();
            let doc = self.build_config(config, &api);
            write_atomic(&config_path, &serde_json::to_vec_pretty(&doc)?, 0o600)?;

            let args = self.build_args(config, &config_path, &api);
            let (child, stdin) = self.core.spawn_logged(&binary, &args)?;

            {
                let mut st = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
                st.api = api;
            }
            self.core.commit_start(child, stdin, binary, version).await;
            self.core.spawn_waiter();
            Ok(())
        }
        .await;

        if result.is_err() {
            self.core.fail_start();
        }
        result
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop().await
    }

    async fn get_stats(&self, deadline: Duration) -> Result<PerformanceMetrics> {
        if !self.core.is_running() {
            return Err(MinerError::NotRunning);
        }
        let api = self.core.api();
        if !api.enabled {
            return Err(MinerError::ConnectionFailed("API disabled".into()));
        }
        let url = format!("http://{}:{}/2/summary", api.host, api.port);
        let cap = deadline.min(STATS_CAP);

        let resp = timeout(cap, self.client.get(&url).send())
            .await
            .map_err(|_| MinerError::Timeout(format!("stats fetch from {}", url)))?
            .map_err(|e| MinerError::ConnectionFailed(e.to_string()))?;
        let summary: XmrigSummary = timeout(cap, resp.json())
            .await
            .map_err(|_| MinerError::Timeout(format!("stats decode from {}", url)))?
            .map_err(|e| MinerError::ConnectionFailed(e.to_string()))?;

        Ok(summary.into_metrics())
    }

    async fn write_stdin(&self, line: &str) -> Result<()> {
        self.core.write_stdin(line).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct XmrigSummary {
    #[serde(default)]
    algo: Option<String>,
    #[serde(default)]
    uptime: u64,
    #[serde(default)]
    hashrate: XmrigHashrate,
    #[serde(default)]
    results: XmrigResults,
    #[serde(default)]
    connection: XmrigConnection,
}

#[derive(Debug, Default, Deserialize)]
struct XmrigHashrate {
    #[serde(default)]
    total: Vec<Option<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct XmrigResults {
    #[serde(default)]
    diff_current: f64,
    #[serde(default)]
    shares_good: u64,
    #[serde(default)]
    shares_total: u64,
    #[serde(default)]
    hashes_total: u64,
}

#[derive(Debug, Default, Deserialize)]
struct XmrigConnection {
    #[serde(default)]
    uptime: u64,
}

impl XmrigSummary {
    fn into_metrics(self) -> PerformanceMetrics {
        let hashrate = self.hashrate.total.first().copied().flatten().unwrap_or(0.0);
        let shares = self.results.shares_good;
        let rejected = self.results.shares_total.saturating_sub(shares);
        let avg_difficulty = if shares > 0 {
            self.results.hashes_total as f64 / shares as f64
        } else {
            0.0
        };
        PerformanceMetrics {
            hashrate,
            shares,
            rejected,
            uptime: if self.uptime > 0 {
                self.uptime
            } else {
                self.connection.uptime
            },
            algorithm: self.algo.unwrap_or_default(),
            avg_difficulty,
            diff_current: self.results.diff_current,
        }
    }
}
