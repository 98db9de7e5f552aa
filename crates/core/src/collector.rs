//! Background stats harvesting and database retention.

use crate::events::{now_unix, EventType};
use crate::supervisor::Supervisor;
use futures::future::join_all;
use openminerd_miner_adapters::HIGH_RES_INTERVAL_SECS;
use openminerd_store::{HashratePoint, Resolution};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

const STATS_TIMEOUT: Duration = Duration::from_secs(5);
const RETENTION_TICK: Duration = Duration::from_secs(60 * 60);

pub struct StatsCollector;

impl StatsCollector {
    /// Spawn the 10-second harvest loop. Exits when the supervisor's stop
    /// signal fires.
    pub fn spawn(supervisor: Arc<Supervisor>) -> JoinHandle<()> {
        let mut stop = supervisor.stop_signal();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(HIGH_RES_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        collect_once(&supervisor).await;
                    }
                    _ = stop.changed() => {
                        debug!("stats collector exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the hourly retention pruner; a no-op when persistence is off.
    pub fn spawn_retention(supervisor: Arc<Supervisor>) -> JoinHandle<()> {
        let mut stop = supervisor.stop_signal();
        tokio::spawn(async move {
            let mut tick = interval(RETENTION_TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        prune_once(&supervisor).await;
                    }
                    _ = stop.changed() => {
                        debug!("retention task exiting");
                        break;
                    }
                }
            }
        })
    }
}

/// One harvest pass: snapshot instances, fetch stats in parallel, record
/// samples, forward to the store, emit `miner.stats`. Individual failures
/// are logged and skipped; the batch never aborts.
pub async fn collect_once(supervisor: &Supervisor) -> usize {
    let instances = supervisor.snapshot().await;
    let (db_enabled, _) = supervisor.db_settings();
    if instances.is_empty() {
        return 0;
    }

    let fetches = instances.into_iter().map(|(name, kind, instance)| async move {
        match instance.get_stats(STATS_TIMEOUT).await {
            Ok(metrics) => Some((name, kind, instance, metrics)),
            Err(e) => {
                debug!("stats for '{}' unavailable: {}", name, e);
                None
            }
        }
    });

    let store = supervisor.history_store();
    let mut sampled = 0;
    for result in join_all(fetches).await.into_iter().flatten() {
        let (name, kind, instance, metrics) = result;
        let now = now_unix();
        let point = HashratePoint::new(now, metrics.hashrate as u64);

        let history = instance.history();
        let first_sample = history.snapshot().is_empty();
        history.add(point);
        history.reduce(now);
        if first_sample {
            supervisor.emit(
                EventType::MinerConnected,
                serde_json::json!({ "name": name }),
            );
        }

        if db_enabled {
            if let Err(e) = store
                .insert_point(&name, &kind, point, Resolution::High)
                .await
            {
                // Persistence degrades to in-memory only.
                warn!("history store insert for '{}' failed: {}", name, e);
            }
        }

        supervisor.emit(
            EventType::MinerStats,
            serde_json::json!({
                "name": name,
                "hashrate": metrics.hashrate,
                "shares": metrics.shares,
                "rejected": metrics.rejected,
                "uptime": metrics.uptime,
                "algorithm": metrics.algorithm,
                "diffCurrent": metrics.diff_current,
            }),
        );
        sampled += 1;
    }
    sampled
}

/// One retention pass over the history store.
pub async fn prune_once(supervisor: &Supervisor) {
    let (db_enabled, retention_days) = supervisor.db_settings();
    if !db_enabled {
        return;
    }
    let cutoff = now_unix().saturating_sub(u64::from(retention_days) * 24 * 60 * 60);
    match supervisor.history_store().prune_before(cutoff).await {
        Ok(dropped) if dropped > 0 => debug!("pruned {} history points", dropped),
        Ok(_) => {}
        Err(e) => warn!("history retention prune failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MinersDocument;
    use openminerd_miner_adapters::{MinerConfig, MinerFactory, VersionRegistry};
    use openminerd_store::{HistoryStore, InstanceStats, JsonRepository, NoopHistoryStore};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn sim_config() -> MinerConfig {
        MinerConfig {
            pool_url: "pool.example.com:3333".into(),
            wallet: "wallet".into(),
            algorithm: "rx/0".into(),
            ..Default::default()
        }
    }

    fn supervisor_with_store(
        dir: &tempfile::TempDir,
        store: Arc<dyn HistoryStore>,
        db_enabled: bool,
    ) -> Arc<Supervisor> {
        let factory = Arc::new(MinerFactory::with_defaults(
            Arc::new(VersionRegistry::new(reqwest::Client::new())),
            reqwest::Client::new(),
        ));
        let repo = Arc::new(JsonRepository::<MinersDocument>::new(
            dir.path().join("miners").join("config.json"),
        ));
        if db_enabled {
            repo.update(|doc| {
                doc.database.enabled = true;
                Ok(())
            })
            .unwrap();
        }
        Supervisor::new(factory, repo, store)
    }

    struct RecordingStore {
        points: Mutex<Vec<(String, HashratePoint)>>,
    }

    #[async_trait::async_trait]
    impl HistoryStore for RecordingStore {
        async fn insert_point(
            &self,
            instance: &str,
            _miner_type: &str,
            point: HashratePoint,
            _resolution: Resolution,
        ) -> openminerd_store::Result<()> {
            self.points
                .lock()
                .unwrap()
                .push((instance.to_string(), point));
            Ok(())
        }
        async fn get_stats(&self, _i: &str) -> openminerd_store::Result<InstanceStats> {
            Ok(InstanceStats::default())
        }
        async fn get_points(
            &self,
            _i: &str,
            _r: Resolution,
            _s: u64,
            _u: u64,
        ) -> openminerd_store::Result<Vec<HashratePoint>> {
            Ok(Vec::new())
        }
        async fn get_all_stats(&self) -> openminerd_store::Result<Vec<InstanceStats>> {
            Ok(Vec::new())
        }
        async fn prune_before(&self, _c: u64) -> openminerd_store::Result<u64> {
            Ok(0)
        }
        async fn close(&self) -> openminerd_store::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn harvests_running_instances_into_history() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with_store(&dir, Arc::new(NoopHistoryStore), false);
        let ctx = CancellationToken::new();
        let inst = sup.start(&ctx, "simulated", sim_config()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let sampled = collect_once(&sup).await;
        assert_eq!(sampled, 1);
        assert!(!inst.history().snapshot().is_empty());
        sup.stop().await;
    }

    #[tokio::test]
    async fn forwards_points_when_database_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore {
            points: Mutex::new(Vec::new()),
        });
        let sup = supervisor_with_store(&dir, store.clone(), true);
        let ctx = CancellationToken::new();
        sup.start(&ctx, "simulated", sim_config()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        collect_once(&sup).await;
        let points = store.points.lock().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].0, "simulated-rx/0");
        drop(points);
        sup.stop().await;
    }

    #[tokio::test]
    async fn dead_instance_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with_store(&dir, Arc::new(NoopHistoryStore), false);
        let ctx = CancellationToken::new();

        let healthy = sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        let mut cfg = sim_config();
        cfg.algorithm = "rx/dead".into();
        let dead = sup.start(&ctx, "simulated", cfg).await.unwrap();
        // Kill one behind the collector's back.
        dead.stop().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let sampled = collect_once(&sup).await;
        assert_eq!(sampled, 1);
        assert!(!healthy.history().snapshot().is_empty());
        sup.stop().await;
    }

    #[tokio::test]
    async fn empty_supervisor_is_a_cheap_tick() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with_store(&dir, Arc::new(NoopHistoryStore), false);
        assert_eq!(collect_once(&sup).await, 0);
    }
}
