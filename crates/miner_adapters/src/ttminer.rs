//! TT-Miner adapter. Same subprocess shape as XMRig with a different
//! summary schema, endpoint path and launch flags.

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
use tracing::info;

const KIND: &str = "tt-miner";
const BIN_NAME: &str = "TT-Miner";
const STATS_CAP: Duration = Duration::from_secs(5);

pub struct TtMiner {
    core: Arc<ProcessCore>,
    registry: Arc<VersionRegistry>,
    client: reqwest::Client,
    install_base: PathBuf,
    config_base: PathBuf,
}

impl TtMiner {
    pub fn new(registry: Arc<VersionRegistry>, client: reqwest::Client) -> Self {
        let config_base = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("openminerd");
        Self::with_paths(registry, client, crate::process::install_base(), config_base)
    }

    pub fn with_paths(
        registry: Arc<VersionRegistry>,
        client: reqwest::Client,
        install_base: PathBuf,
        config_base: PathBuf,
    ) -> Self {
        Self {
            core: Arc::new(ProcessCore::new("tt-miner")),
            registry,
            client,
            install_base,
            config_base,
        }
    }

    fn config_path(&self) -> PathBuf {
        let name = self.core.name();
        let file = if name.is_empty() {
            "tt-miner.json".to_string()
        } else {
            format!("{}.json", sanitize_suffix(&name).replace('/', "_"))
        };
        self.config_base.join(KIND).join(file)
    }

    fn build_config(&self, config: &MinerConfig, api: &ApiEndpoint) -> serde_json::Value {
        serde_json::json!({
            "pool": config.pool_url,
            "user": config.wallet,
            "algo": config.algorithm,
            "tls": config.tls,
            "api": {
                "enabled": api.enabled,
                "bind": format!("{}:{}", api.host, api.port),
            },
        })
    }

    fn build_args(
        &self,
        config: &MinerConfig,
        config_path: &PathBuf,
        api: &ApiEndpoint,
    ) -> Vec<String> {
        let mut args = vec![
            "-cfg".to_string(),
            config_path.display().to_string(),
            "-a".into(),
            config.algorithm.clone(),
            "-o".into(),
            config.pool_url.clone(),
            "-u".into(),
            config.wallet.clone(),
        ];
        if api.enabled {
            args.push("--api-bind".into());
            args.push(format!("{}:{}", api.host, api.port));
        }
        if config.threads > 0 {
            args.push("-t".into());
            args.push(config.threads.to_string());
        }
        for extra in config.cli_args.split_whitespace() {
            args.push(extra.to_string());
        }
        args
    }
}

#[async_trait]
impl Miner for TtMiner {
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
            None => Ok(true),
        }
    }

    async fn latest_version(&self) -> Result<String> {
        self.registry.latest_version(KIND).await
    }

    async fn install(&self) -> Result<PathBuf> {
        let version = match self.registry.latest_version(KIND).await {
            Ok(v) => v,
            Err(e) => self.registry.recommended_version(KIND).ok_or_else(|| {
                MinerError::StartFailed(format!("cannot resolve a version to install: {}", e))
            })?,
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
        let url = format!("http://{}:{}/summary", api.host, api.port);
        let cap = deadline.min(STATS_CAP);

        let resp = timeout(cap, self.client.get(&url).send())
            .await
            .map_err(|_| MinerError::Timeout(format!("stats fetch from {}", url)))?
            .map_err(|e| MinerError::ConnectionFailed(e.to_string()))?;
        let summary: TtSummary = timeout(cap, resp.json())
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
struct TtSummary {
    #[serde(default)]
    algorithm: String,
    #[serde(default)]
    hashrate: f64,
    #[serde(default)]
    accepted: u64,
    #[serde(default)]
    rejected: u64,
    #[serde(default)]
    uptime: u64,
    #[serde(default)]
    difficulty: f64,
    #[serde(default)]
    total_hashes: u64,
}

impl TtSummary {
    fn into_metrics(self) -> PerformanceMetrics {
        let avg_difficulty = if self.accepted > 0 {
            self.total_hashes as f64 / self.accepted as f64
        } else {
            0.0
        };
        PerformanceMetrics {
            hashrate: self.hashrate,
            shares: self.accepted,
            rejected: self.rejected,
            uptime: self.uptime,
            algorithm: self.algorithm,
            avg_difficulty,
            diff_current: self.difficulty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner(dir: &tempfile::TempDir) -> TtMiner {
        TtMiner::with_paths(
            Arc::new(VersionRegistry::new(reqwest::Client::new())),
            reqwest::Client::new(),
            dir.path().join("miners"),
            dir.path().join("config"),
        )
    }

    #[test]
    fn args_use_tt_miner_flags() {
        let dir = tempfile::tempdir().unwrap();
        let m = miner(&dir);
        let cfg = MinerConfig {
            pool_url: "pool.example.com:4444".into(),
            wallet: "wallet".into(),
            algorithm: "ethash".into(),
            ..Default::default()
        };
        let api = ApiEndpoint {
            host: "127.0.0.1".into(),
            port: 4068,
            enabled: true,
        };
        let args = m.build_args(&cfg, &PathBuf::from("/tmp/t.json"), &api);
        let joined = args.join(" ");
        assert!(joined.contains("-a ethash"));
        assert!(joined.contains("--api-bind 127.0.0.1:4068"));
    }

    #[test]
    fn summary_maps_to_canonical_metrics() {
        let raw = serde_json::json!({
            "algorithm": "ethash",
            "hashrate": 55000000.0,
            "accepted": 20,
            "rejected": 1,
            "uptime": 300,
            "difficulty": 4000000.0,
            "total_hashes": 2000000
        });
        let summary: TtSummary = serde_json::from_value(raw).unwrap();
        let m = summary.into_metrics();
        assert_eq!(m.shares, 20);
        assert_eq!(m.rejected, 1);
        assert_eq!(m.avg_difficulty, 100000.0);
        assert_eq!(m.algorithm, "ethash");
    }
}
