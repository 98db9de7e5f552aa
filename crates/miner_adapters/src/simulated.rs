//! In-process simulated miner for tests and demo runs. Produces
//! deterministic logs and stats without spawning any binary.

use crate::process::ApiEndpoint;
use crate::{
    HashrateHistory, LogBuffer, Miner, MinerConfig, MinerError, PerformanceMetrics, Result,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::info;

const BASE_HASHRATE_PER_THREAD: u64 = 1000;

struct SimStats {
    running: AtomicBool,
    hashrate: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    uptime: AtomicU64,
}

pub struct SimulatedMiner {
    name: Mutex<String>,
    algorithm: Mutex<String>,
    stop_signal: Mutex<Option<mpsc::Sender<()>>>,
    stats: Arc<SimStats>,
    logs: Arc<LogBuffer>,
    history: Arc<HashrateHistory>,
    /// Tick cadence; shortened in tests.
    tick: Duration,
}

impl SimulatedMiner {
    pub fn new() -> Self {
        Self::with_tick(Duration::from_secs(1))
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            name: Mutex::new(String::new()),
            algorithm: Mutex::new(String::new()),
            stop_signal: Mutex::new(None),
            stats: Arc::new(SimStats {
                running: AtomicBool::new(false),
                hashrate: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                uptime: AtomicU64::new(0),
            }),
            logs: Arc::new(LogBuffer::default()),
            history: Arc::new(HashrateHistory::new()),
            tick,
        }
    }
}

impl Default for SimulatedMiner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Miner for SimulatedMiner {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    fn name(&self) -> String {
        self.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
    }

    fn version(&self) -> Option<String> {
        Some("0.0.0".to_string())
    }

    fn install_path(&self) -> PathBuf {
        PathBuf::new()
    }

    fn binary_path(&self) -> Option<PathBuf> {
        None
    }

    fn api(&self) -> ApiEndpoint {
        ApiEndpoint::default()
    }

    fn set_api_port(&self, _port: u16) {}

    fn is_running(&self) -> bool {
        self.stats.running.load(Ordering::SeqCst)
    }

    fn history(&self) -> Arc<HashrateHistory> {
        self.history.clone()
    }

    fn log_buffer(&self) -> Arc<LogBuffer> {
        self.logs.clone()
    }

    async fn check_installation(&self) -> Result<bool> {
        Ok(true)
    }

    async fn latest_version(&self) -> Result<String> {
        Ok("0.0.0".to_string())
    }

    async fn install(&self) -> Result<PathBuf> {
        Ok(PathBuf::new())
    }

    async fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, config: &MinerConfig) -> Result<()> {
        if self.stats.running.swap(true, Ordering::SeqCst) {
            return Err(MinerError::AlreadyRunning);
        }
        *self.algorithm.lock().unwrap_or_else(|e| e.into_inner()) = config.algorithm.clone();

        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.stop_signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let stats = self.stats.clone();
        stats.hashrate.store(0, Ordering::SeqCst);
        stats.accepted.store(0, Ordering::SeqCst);
        stats.rejected.store(0, Ordering::SeqCst);
        stats.uptime.store(0, Ordering::SeqCst);

        let logs = self.logs.clone();
        let pool = config.pool_url.clone();
        let tick_period = self.tick;
        let base_hashrate = BASE_HASHRATE_PER_THREAD * u64::from(config.effective_threads());

        info!("simulated miner starting against {}", pool);
        tokio::spawn(async move {
            let mut tick = interval(tick_period);
            let mut second = 0u64;

            logs.push("[INFO] simulated miner 0.0.0");
            logs.push(&format!("[INFO] connecting to {}", pool));

            loop {
                tokio::select! {
                    _ = rx.recv() => {
                        logs.push("[INFO] stopping...");
                        stats.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ = tick.tick() => {
                        second += 1;
                        stats.uptime.store(second, Ordering::SeqCst);

                        // Deterministic hashrate with small periodic variance.
                        let hr = base_hashrate + (second % 10) * 10;
                        stats.hashrate.store(hr, Ordering::SeqCst);

                        if second % 5 == 0 {
                            let accepted = stats.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                            logs.push(&format!("[INFO] accepted ({}/0) diff 100000", accepted));
                        }
                        if second % 30 == 0 {
                            stats.rejected.fetch_add(1, Ordering::SeqCst);
                            logs.push("[WARN] rejected share");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let tx = self
            .stop_signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match tx {
            Some(tx) => {
                let _ = tx.send(()).await;
                self.stats.running.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => Err(MinerError::NotRunning),
        }
    }

    async fn get_stats(&self, _deadline: Duration) -> Result<PerformanceMetrics> {
        if !self.is_running() {
            return Err(MinerError::NotRunning);
        }
        let hr = self.stats.hashrate.load(Ordering::SeqCst) as f64;
        let accepted = self.stats.accepted.load(Ordering::SeqCst);
        Ok(PerformanceMetrics {
            hashrate: hr,
            shares: accepted,
            rejected: self.stats.rejected.load(Ordering::SeqCst),
            uptime: self.stats.uptime.load(Ordering::SeqCst),
            algorithm: self
                .algorithm
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            avg_difficulty: if accepted > 0 { 100_000.0 } else { 0.0 },
            diff_current: 100_000.0,
        })
    }

    async fn write_stdin(&self, line: &str) -> Result<()> {
        if !self.is_running() {
            return Err(MinerError::NotRunning);
        }
        self.logs.push(&format!("[STDIN] {}", line.trim_end()));
        Ok(())
    }
}
