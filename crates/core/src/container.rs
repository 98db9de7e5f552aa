//! Ordered wiring of the core services.
//!
//! `initialize` builds everything in dependency order, `start` brings the
//! background machinery up, `shutdown` tears it down in reverse. The
//! supervisor and the hub reference each other; the cycle is broken on the
//! way down by clearing the hub's state provider before stopping either
//! side.

use crate::collector::StatsCollector;
use crate::config::{
    miners_config_path, profiles_path, settings_path, MinersDocument, Settings,
};
use crate::error::{CoreError, Result};
use crate::hub::{EventHub, HubConfig};
use crate::profiles::ProfileStore;
use crate::ratelimit::RateLimiter;
use crate::supervisor::{Supervisor, SupervisorStateProvider};
use async_trait::async_trait;
use openminerd_miner_adapters::{MinerFactory, VersionRegistry};
use openminerd_store::{HistoryStore, JsonRepository, NoopHistoryStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Optional peer-to-peer sidecar. A failing node service degrades the
/// container instead of aborting it; the transport itself lives outside
/// this workspace.
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub struct ContainerConfig {
    pub config_base: PathBuf,
    /// Injected durable store; `None` runs with the no-op store.
    pub history_store: Option<Arc<dyn HistoryStore>>,
    /// Injected factory; `None` registers the built-in miner types.
    pub factory: Option<Arc<MinerFactory>>,
    pub node_service: Option<Arc<dyn NodeService>>,
    pub hub: HubConfig,
    /// API admission: requests per second, burst.
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            config_base: crate::config::config_base(),
            history_store: None,
            factory: None,
            node_service: None,
            hub: HubConfig::default(),
            rate_limit_rps: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

struct Services {
    store: Arc<dyn HistoryStore>,
    miners_repo: Arc<JsonRepository<MinersDocument>>,
    profiles: Arc<ProfileStore>,
    settings_repo: Arc<JsonRepository<Settings>>,
    supervisor: Arc<Supervisor>,
    hub: Arc<EventHub>,
    rate_limiter: Arc<RateLimiter>,
    node: Option<Arc<dyn NodeService>>,
}

pub struct ServiceContainer {
    config: ContainerConfig,
    services: Mutex<Option<Arc<Services>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceContainer {
    pub fn new(config: ContainerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            services: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Build all services in dependency order. Calling twice is an error.
    pub async fn initialize(&self) -> Result<()> {
        let mut slot = self.services.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(CoreError::Internal("container already initialized".into()));
        }

        let store: Arc<dyn HistoryStore> = self
            .config
            .history_store
            .clone()
            .unwrap_or_else(|| Arc::new(NoopHistoryStore));

        let miners_repo = Arc::new(JsonRepository::<MinersDocument>::new(
            miners_config_path(&self.config.config_base),
        ));
        let profiles = Arc::new(ProfileStore::new(profiles_path(&self.config.config_base)));
        let settings_repo = Arc::new(JsonRepository::<Settings>::new(settings_path(
            &self.config.config_base,
        )));

        let factory = self.config.factory.clone().unwrap_or_else(|| {
            let client = reqwest::Client::new();
            Arc::new(MinerFactory::with_defaults(
                Arc::new(VersionRegistry::new(client.clone())),
                client,
            ))
        });
        let supervisor = Supervisor::new(factory, miners_repo.clone(), store.clone());

        let node = self.config.node_service.clone();

        let hub = EventHub::new(self.config.hub.clone());
        supervisor.set_hub(Some(hub.clone()));
        hub.set_state_provider(Some(Arc::new(SupervisorStateProvider::new(
            supervisor.clone(),
        ))));

        let rate_limiter =
            RateLimiter::new(self.config.rate_limit_rps, self.config.rate_limit_burst);

        *slot = Some(Arc::new(Services {
            store,
            miners_repo,
            profiles,
            settings_repo,
            supervisor,
            hub,
            rate_limiter,
            node,
        }));
        info!("service container initialized");
        Ok(())
    }

    /// Spawn the hub loop, the stats collector, the retention pruner, and
    /// the optional node transport; then launch autostart miners.
    pub async fn start(&self) -> Result<()> {
        let services = self.services()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Internal("container already started".into()));
        }

        services.hub.spawn_loop();
        {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.push(StatsCollector::spawn(services.supervisor.clone()));
            background.push(StatsCollector::spawn_retention(services.supervisor.clone()));
        }

        if let Some(node) = &services.node {
            if let Err(e) = node.start().await {
                // Degraded, not fatal.
                warn!("node service failed to start: {}", e);
            }
        }

        self.launch_autostart(&services).await;
        info!("service container started");
        Ok(())
    }

    async fn launch_autostart(&self, services: &Services) {
        let settings = services.settings_repo.load().unwrap_or_default();
        if !settings.behavior.autostart_on_launch {
            return;
        }
        let doc = match services.miners_repo.load() {
            Ok(doc) => doc,
            Err(e) => {
                warn!("cannot read autostart list: {}", e);
                return;
            }
        };
        let ctx = CancellationToken::new();
        for entry in doc.miners.iter().filter(|m| m.autostart) {
            let Some(config) = entry.config.clone() else {
                continue;
            };
            match services
                .supervisor
                .start(&ctx, &entry.miner_type, config)
                .await
            {
                Ok(inst) => info!("autostarted '{}'", inst.name()),
                Err(e) => warn!("autostart of {} failed: {}", entry.miner_type, e),
            }
        }
    }

    /// Reverse-order teardown; `shutdown_channel` closes exactly once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let services = {
            let slot = self.services.lock().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        if let Some(services) = services {
            // Break the supervisor<->hub cycle before stopping either side.
            services.hub.set_state_provider(None);

            if let Some(node) = &services.node {
                if let Err(e) = node.stop().await {
                    warn!("node service stop failed: {}", e);
                }
            }
            services.hub.stop();
            services.supervisor.set_hub(None);
            services.supervisor.stop().await;
            services.rate_limiter.stop();
            if let Err(e) = services.store.close().await {
                warn!("history store close failed: {}", e);
            }
        }
        for handle in self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        let _ = self.shutdown_tx.send(true);
        info!("service container shut down");
    }

    /// Observers of container shutdown completion.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn services(&self) -> Result<Arc<Services>> {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CoreError::Internal("container not initialized".into()))
    }

    pub fn supervisor(&self) -> Result<Arc<Supervisor>> {
        Ok(self.services()?.supervisor.clone())
    }

    pub fn hub(&self) -> Result<Arc<EventHub>> {
        Ok(self.services()?.hub.clone())
    }

    pub fn profiles(&self) -> Result<Arc<ProfileStore>> {
        Ok(self.services()?.profiles.clone())
    }

    pub fn rate_limiter(&self) -> Result<Arc<RateLimiter>> {
        Ok(self.services()?.rate_limiter.clone())
    }

    pub fn history_store(&self) -> Result<Arc<dyn HistoryStore>> {
        Ok(self.services()?.store.clone())
    }
}
