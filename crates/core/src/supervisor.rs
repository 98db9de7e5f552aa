//! Miner lifecycle supervisor.
//!
//! Owns the only strong references to running instances. `list`/`get`
//! borrow under the read lock; all mutations take the write lock. Process
//! and network waits always happen outside the map lock, after a
//! snapshot, so lookups never stall behind a slow miner.

use crate::config::MinersDocument;
use crate::error::{CoreError, Result};
use crate::events::{now_unix, Event, EventType};
use crate::hub::{EventHub, StateProvider};
use async_trait::async_trait;
use openminerd_miner_adapters::{
    allocate_port, derive_instance_name, last_point, Miner, MinerConfig, MinerFactory,
};
use openminerd_store::{HistoryStore, JsonRepository};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound on waiting for all miners during supervisor shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

pub struct Supervisor {
    instances: RwLock<HashMap<String, Arc<dyn Miner>>>,
    factory: Arc<MinerFactory>,
    miners_repo: Arc<JsonRepository<MinersDocument>>,
    store: Arc<dyn HistoryStore>,
    hub: Mutex<Option<Arc<EventHub>>>,
    stop_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(
        factory: Arc<MinerFactory>,
        miners_repo: Arc<JsonRepository<MinersDocument>>,
        store: Arc<dyn HistoryStore>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            factory,
            miners_repo,
            store,
            hub: Mutex::new(None),
            stop_tx,
        })
    }

    pub fn factory(&self) -> &MinerFactory {
        &self.factory
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    /// Database knobs from the miners document (enabled, retention days).
    pub fn db_settings(&self) -> (bool, u32) {
        match self.miners_repo.load() {
            Ok(doc) => (doc.database.enabled, doc.database.retention_days),
            Err(e) => {
                warn!("cannot read miners config, assuming database off: {}", e);
                (false, 30)
            }
        }
    }

    /// Receiver that flips to `true` when the supervisor shuts down;
    /// background tasks use it as their exit signal.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn set_hub(&self, hub: Option<Arc<EventHub>>) {
        *self.hub.lock().unwrap_or_else(|e| e.into_inner()) = hub;
    }

    /// Broadcast through the hub, never under the map lock. Saturation
    /// drops the event inside the hub.
    pub(crate) fn emit(&self, event_type: EventType, data: serde_json::Value) {
        let hub = self.hub.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hub) = hub {
            hub.broadcast(Event::new(event_type, data));
        }
    }

    /// Create, name, and launch a new miner instance.
    pub async fn start(
        &self,
        ctx: &CancellationToken,
        miner_type: &str,
        config: MinerConfig,
    ) -> Result<Arc<dyn Miner>> {
        self.start_internal(ctx, miner_type, config, None).await
    }

    /// Launch from a saved profile; lifecycle events carry its id.
    pub async fn start_from_profile(
        &self,
        ctx: &CancellationToken,
        profile: &crate::config::Profile,
    ) -> Result<Arc<dyn Miner>> {
        self.start_internal(
            ctx,
            &profile.miner_type,
            profile.config.clone(),
            Some(&profile.id),
        )
        .await
    }

    async fn start_internal(
        &self,
        ctx: &CancellationToken,
        miner_type: &str,
        config: MinerConfig,
        profile_id: Option<&str>,
    ) -> Result<Arc<dyn Miner>> {
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        // Reserve the name under the write lock; launch outside it.
        let (name, kind, instance) = {
            let mut instances = self.instances.write().await;

            config.validate()?;
            let instance = self.factory.create(miner_type)?;
            let kind = instance.kind().to_string();

            let name = derive_instance_name(&kind, &config.algorithm, now_unix());
            if instances.contains_key(&name) {
                return Err(CoreError::AlreadyExists(name));
            }

            instance.set_name(&name);
            if config.api_port != 0 {
                instance.set_api_port(config.api_port);
            } else {
                instance.set_api_port(allocate_port()?);
            }

            instances.insert(name.clone(), instance.clone());
            (name, kind, instance)
        };

        let mut starting = serde_json::json!({ "name": name });
        if let Some(pid) = profile_id {
            starting["profileId"] = pid.into();
        }
        self.emit(EventType::MinerStarting, starting);

        if let Err(e) = instance.start(&config).await {
            // Roll back the reservation; the failed start leaves no trace.
            self.instances.write().await.remove(&name);
            let core_err: CoreError = e.into();
            self.emit(
                EventType::MinerError,
                serde_json::json!({ "name": name, "error": core_err.to_string() }),
            );
            return Err(core_err);
        }

        if let Err(e) = self.miners_repo.update(|doc| {
            doc.set_autostart(&kind, true, Some(config.clone()));
            Ok(())
        }) {
            warn!("failed to persist autostart state: {}", e);
        }

        info!("started {} '{}'", kind, name);
        let mut started = serde_json::json!({ "name": name, "pool": config.pool_url });
        if let Some(pid) = profile_id {
            started["profileId"] = pid.into();
        }
        self.emit(EventType::MinerStarted, started);
        Ok(instance)
    }

    /// Stop one instance by name. Exact match first; a prefix matches only
    /// when it is unambiguous. The instance is removed from the map whatever
    /// the stop outcome, so a crashed or externally killed miner can always
    /// be cleared.
    pub async fn stop_instance(&self, ctx: &CancellationToken, name: &str) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let (resolved, instance) = {
            let mut instances = self.instances.write().await;
            let resolved = match resolve_name(&instances, name) {
                Some(n) => n,
                None => return Err(CoreError::NotFound(name.to_string())),
            };
            let Some(instance) = instances.remove(&resolved) else {
                return Err(CoreError::NotFound(name.to_string()));
            };
            (resolved, instance)
        };

        self.emit(
            EventType::MinerStopping,
            serde_json::json!({ "name": resolved }),
        );

        let kind = instance.kind().to_string();
        let outcome = instance.stop().await;
        let (reason, result) = match outcome {
            Ok(()) => ("requested", Ok(())),
            // Already dead (crash or external kill): removal is the point.
            Err(openminerd_miner_adapters::MinerError::NotRunning) => ("not running", Ok(())),
            Err(e) => ("stop failed", Err(CoreError::from(e))),
        };

        if let Err(e) = self.miners_repo.update(|doc| {
            doc.set_autostart(&kind, false, None);
            Ok(())
        }) {
            warn!("failed to persist autostart state: {}", e);
        }

        info!("stopped '{}' ({})", resolved, reason);
        self.emit(
            EventType::MinerStopped,
            serde_json::json!({ "name": resolved, "reason": reason }),
        );
        result
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Miner>> {
        self.instances.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<dyn Miner>> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Snapshot for the stats collector: name, kind, handle.
    pub async fn snapshot(&self) -> Vec<(String, String, Arc<dyn Miner>)> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(name, inst)| (name.clone(), inst.kind().to_string(), inst.clone()))
            .collect()
    }

    /// Adopt an externally constructed instance (tests, recovery).
    pub async fn register(&self, instance: Arc<dyn Miner>) -> Result<()> {
        let name = instance.name();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("instance has no name".into()));
        }
        let mut instances = self.instances.write().await;
        if instances.contains_key(&name) {
            return Err(CoreError::AlreadyExists(name));
        }
        instances.insert(name, instance);
        Ok(())
    }

    /// In-memory hashrate history for one instance.
    pub async fn hashrate_history(
        &self,
        name: &str,
    ) -> Result<Vec<openminerd_store::HashratePoint>> {
        let instance = self
            .get(name)
            .await
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        Ok(instance.history().snapshot())
    }

    /// Stop and remove every instance of `miner_type`, then delete its
    /// on-disk installs and autostart entry.
    pub async fn uninstall(&self, ctx: &CancellationToken, miner_type: &str) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let kind = self
            .factory
            .resolve(miner_type)
            .ok_or_else(|| CoreError::UnsupportedType(miner_type.to_string()))?;

        // Snapshot and remove under the lock; stopping happens outside it.
        let victims: Vec<(String, Arc<dyn Miner>)> = {
            let mut instances = self.instances.write().await;
            let names: Vec<String> = instances
                .iter()
                .filter(|(_, inst)| inst.kind() == kind)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|n| instances.remove(&n).map(|i| (n, i)))
                .collect()
        };

        let mut representative: Option<Arc<dyn Miner>> = None;
        for (name, instance) in victims {
            self.emit(
                EventType::MinerStopping,
                serde_json::json!({ "name": name }),
            );
            if let Err(e) = instance.stop().await {
                warn!("stopping '{}' during uninstall: {}", name, e);
            }
            self.emit(
                EventType::MinerStopped,
                serde_json::json!({ "name": name, "reason": "uninstall" }),
            );
            representative = Some(instance);
        }

        let representative = match representative {
            Some(r) => r,
            None => self.factory.create(&kind)?,
        };
        representative.uninstall().await.map_err(CoreError::from)?;

        self.miners_repo.update(|doc| {
            doc.remove(&kind);
            Ok(())
        })?;
        info!("uninstalled {}", kind);
        Ok(())
    }

    /// Shut the supervisor down: signal background tasks, then stop every
    /// miner, bounded by [`SHUTDOWN_WAIT`].
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);

        let victims: Vec<(String, Arc<dyn Miner>)> = {
            let mut instances = self.instances.write().await;
            instances.drain().collect()
        };
        if victims.is_empty() {
            return;
        }

        let shutdown = async {
            for (name, instance) in &victims {
                if let Err(e) = instance.stop().await {
                    if !matches!(e, openminerd_miner_adapters::MinerError::NotRunning) {
                        error!("failed to stop '{}' during shutdown: {}", name, e);
                    }
                }
            }
        };
        if timeout(SHUTDOWN_WAIT, shutdown).await.is_err() {
            warn!(
                "miners still stopping after {:?}; abandoning the wait",
                SHUTDOWN_WAIT
            );
        }
    }
}

fn resolve_name(instances: &HashMap<String, Arc<dyn Miner>>, name: &str) -> Option<String> {
    if instances.contains_key(name) {
        return Some(name.to_string());
    }
    // Prefix fallback for human-friendly lookup, only when unambiguous.
    let mut matches = instances.keys().filter(|k| k.starts_with(name));
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first.clone())
}

/// Builds `state.sync` snapshots for freshly registered hub subscribers.
pub struct SupervisorStateProvider {
    supervisor: Arc<Supervisor>,
}

impl SupervisorStateProvider {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl StateProvider for SupervisorStateProvider {
    async fn state_sync(&self) -> Event {
        let mut miners = Vec::new();
        for instance in self.supervisor.list().await {
            let mut entry = serde_json::json!({
                "name": instance.name(),
                "status": if instance.is_running() { "running" } else { "stopped" },
            });
            if let Some(point) = last_point(&instance.history()) {
                entry["hashrate"] = point.hashrate.into();
            }
            miners.push(entry);
        }
        Event::new(EventType::StateSync, serde_json::json!({ "miners": miners }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openminerd_store::NoopHistoryStore;

    fn sim_config() -> MinerConfig {
        MinerConfig {
            pool_url: "pool.example.com:3333".into(),
            wallet: "wallet".into(),
            algorithm: "rx/0".into(),
            ..Default::default()
        }
    }

    fn supervisor(dir: &tempfile::TempDir) -> Arc<Supervisor> {
        let factory = Arc::new(MinerFactory::with_defaults(
            Arc::new(openminerd_miner_adapters::VersionRegistry::new(
                reqwest::Client::new(),
            )),
            reqwest::Client::new(),
        ));
        let repo = Arc::new(JsonRepository::<MinersDocument>::new(
            dir.path().join("miners").join("config.json"),
        ));
        Supervisor::new(factory, repo, Arc::new(NoopHistoryStore))
    }

    #[tokio::test]
    async fn start_names_and_registers_instance() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        let inst = sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        assert_eq!(inst.name(), "simulated-rx/0");
        assert!(inst.is_running());
        assert!(sup.get("simulated-rx/0").await.is_some());
        assert_eq!(sup.list().await.len(), 1);
        sup.stop().await;
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        let err = match sup.start(&ctx, "simulated", sim_config()).await {
            Err(e) => e,
            Ok(_) => panic!("expected duplicate start to fail"),
        };
        assert!(matches!(err, CoreError::AlreadyExists(_)));
        sup.stop().await;
    }

    #[tokio::test]
    async fn concurrent_duplicate_starts_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let sup = sup.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                sup.start(&ctx, "simulated", sim_config()).await
            }));
        }
        let mut ok = 0;
        let mut already = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(inst) => {
                    assert_eq!(inst.name(), "simulated-rx/0");
                    ok += 1;
                }
                Err(CoreError::AlreadyExists(_)) => already += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(already, 9);
        sup.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        let mut cfg = sim_config();
        cfg.pool_url = "pool;rm -rf".into();
        assert!(matches!(
            sup.start(&ctx, "simulated", cfg).await,
            Err(CoreError::InvalidConfig(_))
        ));
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();
        assert!(matches!(
            sup.start(&ctx, "cgminer", sim_config()).await,
            Err(CoreError::UnsupportedType(_))
        ));
    }

    #[tokio::test]
    async fn stop_removes_instance() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        sup.stop_instance(&ctx, "simulated-rx/0").await.unwrap();
        assert!(sup.get("simulated-rx/0").await.is_none());
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn stop_accepts_unambiguous_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        sup.stop_instance(&ctx, "simulated-rx").await.unwrap();
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_prefix_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        let mut cfg = sim_config();
        cfg.algorithm = "rx/wow".into();
        sup.start(&ctx, "simulated", cfg).await.unwrap();

        assert!(matches!(
            sup.stop_instance(&ctx, "simulated-rx").await,
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(sup.list().await.len(), 2);
        sup.stop().await;
    }

    #[tokio::test]
    async fn stop_of_dead_instance_still_removes() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        let inst = sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        // Kill it behind the supervisor's back.
        inst.stop().await.unwrap();
        // Supervisor stop still succeeds and clears the entry.
        sup.stop_instance(&ctx, "simulated-rx/0").await.unwrap();
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();
        sup.start(&ctx, "simulated", sim_config()).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            sup.stop_instance(&cancelled, "simulated-rx/0").await,
            Err(CoreError::Cancelled)
        ));
        // Map unchanged.
        assert_eq!(sup.list().await.len(), 1);
        assert!(matches!(
            sup.start(&cancelled, "simulated", sim_config()).await,
            Err(CoreError::Cancelled)
        ));
        sup.stop().await;
    }

    #[tokio::test]
    async fn autostart_state_persists() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        let repo = JsonRepository::<MinersDocument>::new(
            dir.path().join("miners").join("config.json"),
        );
        let doc = repo.load().unwrap();
        assert_eq!(doc.miners.len(), 1);
        assert!(doc.miners[0].autostart);
        assert_eq!(doc.miners[0].miner_type, "simulated");

        sup.stop_instance(&ctx, "simulated-rx/0").await.unwrap();
        let doc = repo.load().unwrap();
        assert!(!doc.miners[0].autostart);
    }

    #[tokio::test]
    async fn uninstall_stops_and_clears_type() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        sup.uninstall(&ctx, "simulated").await.unwrap();
        assert!(sup.list().await.is_empty());

        let repo = JsonRepository::<MinersDocument>::new(
            dir.path().join("miners").join("config.json"),
        );
        assert!(repo.load().unwrap().miners.is_empty());
    }

    #[tokio::test]
    async fn hashrate_history_surfaces_instance_series() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let ctx = CancellationToken::new();

        let inst = sup.start(&ctx, "simulated", sim_config()).await.unwrap();
        inst.history()
            .add(openminerd_store::HashratePoint::new(now_unix(), 1234));
        let points = sup.hashrate_history("simulated-rx/0").await.unwrap();
        assert_eq!(points.last().unwrap().hashrate, 1234);
        assert!(matches!(
            sup.hashrate_history("missing").await,
            Err(CoreError::NotFound(_))
        ));
        sup.stop().await;
    }
}
