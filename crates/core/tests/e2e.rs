//! End-to-end scenarios across the container, supervisor, collector and
//! event hub, driven by the simulated miner.

use openminerd_core::{
    channel_transport, collect_once, ContainerConfig, CoreError, EventHub, HubConfig, PeerFrame,
    ServiceContainer,
};
use openminerd_miner_adapters::MinerConfig;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn sim_config() -> MinerConfig {
    MinerConfig {
        pool_url: "pool.example.com:3333".into(),
        wallet: "wallet".into(),
        algorithm: "rx/0".into(),
        ..Default::default()
    }
}

async fn next_text(peer: &mut openminerd_core::ChannelPeer) -> Option<serde_json::Value> {
    loop {
        match timeout(Duration::from_secs(3), peer.frames.recv()).await.ok()?? {
            PeerFrame::Text(t) => return serde_json::from_str(&t).ok(),
            PeerFrame::Ping => continue,
            PeerFrame::Close(_) => return None,
        }
    }
}

#[tokio::test]
async fn lifecycle_events_flow_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let container = ServiceContainer::new(ContainerConfig {
        config_base: dir.path().to_path_buf(),
        ..Default::default()
    });
    container.initialize().await.unwrap();
    container.start().await.unwrap();

    let hub = container.hub().unwrap();
    let (transport, mut peer) = channel_transport(256);
    assert!(hub.subscribe(Box::new(transport)).await);

    // First frame is the state snapshot for the fresh subscriber.
    let sync = next_text(&mut peer).await.unwrap();
    assert_eq!(sync["type"], "state.sync");

    let supervisor = container.supervisor().unwrap();
    let ctx = CancellationToken::new();
    supervisor.start(&ctx, "simulated", sim_config()).await.unwrap();

    let starting = next_text(&mut peer).await.unwrap();
    assert_eq!(starting["type"], "miner.starting");
    assert_eq!(starting["data"]["name"], "simulated-rx/0");
    let started = next_text(&mut peer).await.unwrap();
    assert_eq!(started["type"], "miner.started");
    assert_eq!(started["data"]["pool"], "pool.example.com:3333");

    // A collector pass announces the first sample, then publishes stats.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    collect_once(&supervisor).await;
    let connected = next_text(&mut peer).await.unwrap();
    assert_eq!(connected["type"], "miner.connected");
    let stats = next_text(&mut peer).await.unwrap();
    assert_eq!(stats["type"], "miner.stats");
    assert_eq!(stats["data"]["name"], "simulated-rx/0");
    assert!(stats["data"]["hashrate"].as_f64().unwrap() > 0.0);

    supervisor
        .stop_instance(&ctx, "simulated-rx/0")
        .await
        .unwrap();
    let stopping = next_text(&mut peer).await.unwrap();
    assert_eq!(stopping["type"], "miner.stopping");
    let stopped = next_text(&mut peer).await.unwrap();
    assert_eq!(stopped["type"], "miner.stopped");
    assert_eq!(stopped["data"]["reason"], "requested");

    container.shutdown().await;
}

#[tokio::test]
async fn duplicate_concurrent_starts_admit_one() {
    let dir = tempfile::tempdir().unwrap();
    let container = ServiceContainer::new(ContainerConfig {
        config_base: dir.path().to_path_buf(),
        ..Default::default()
    });
    container.initialize().await.unwrap();
    container.start().await.unwrap();
    let supervisor = container.supervisor().unwrap();
    let ctx = CancellationToken::new();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let supervisor = supervisor.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            supervisor.start(&ctx, "simulated", sim_config()).await
        }));
    }

    let mut winners = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(inst) => {
                assert_eq!(inst.name(), "simulated-rx/0");
                winners += 1;
            }
            Err(CoreError::AlreadyExists(name)) => {
                assert_eq!(name, "simulated-rx/0");
                duplicates += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(duplicates, 9);
    assert_eq!(supervisor.list().await.len(), 1);

    container.shutdown().await;
}

#[tokio::test]
async fn saturated_subscriber_is_expelled() {
    let hub = EventHub::new(HubConfig::default());
    hub.spawn_loop();

    // Queue capacity of one and a peer that never reads.
    let (transport, _peer) = channel_transport(1);
    assert!(hub.subscribe_with_queue(Box::new(transport), 1).await);
    assert_eq!(hub.client_count(), 1);

    for i in 0..5000 {
        hub.broadcast(openminerd_core::Event::new(
            openminerd_core::EventType::MinerStats,
            serde_json::json!({"name": "m", "hashrate": i}),
        ));
        if i % 32 == 0 {
            tokio::task::yield_now().await;
        }
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.client_count(), 0);
    hub.stop();
}

#[tokio::test]
async fn cancelled_stop_leaves_map_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let container = ServiceContainer::new(ContainerConfig {
        config_base: dir.path().to_path_buf(),
        ..Default::default()
    });
    container.initialize().await.unwrap();
    container.start().await.unwrap();
    let supervisor = container.supervisor().unwrap();

    let ctx = CancellationToken::new();
    supervisor.start(&ctx, "simulated", sim_config()).await.unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(matches!(
        supervisor.stop_instance(&cancelled, "simulated-rx/0").await,
        Err(CoreError::Cancelled)
    ));
    assert_eq!(supervisor.list().await.len(), 1);

    container.shutdown().await;
}

#[tokio::test]
async fn profile_start_tags_events_with_profile_id() {
    let dir = tempfile::tempdir().unwrap();
    let container = ServiceContainer::new(ContainerConfig {
        config_base: dir.path().to_path_buf(),
        ..Default::default()
    });
    container.initialize().await.unwrap();
    container.start().await.unwrap();

    let profile = openminerd_core::Profile {
        id: "p-night".into(),
        name: "night shift".into(),
        miner_type: "simulated".into(),
        config: sim_config(),
    };
    container.profiles().unwrap().add(profile.clone()).unwrap();

    let hub = container.hub().unwrap();
    let (transport, mut peer) = channel_transport(64);
    hub.subscribe(Box::new(transport)).await;
    let sync = next_text(&mut peer).await.unwrap();
    assert_eq!(sync["type"], "state.sync");

    let supervisor = container.supervisor().unwrap();
    let ctx = CancellationToken::new();
    supervisor.start_from_profile(&ctx, &profile).await.unwrap();

    let starting = next_text(&mut peer).await.unwrap();
    assert_eq!(starting["type"], "miner.starting");
    assert_eq!(starting["data"]["profileId"], "p-night");
    let started = next_text(&mut peer).await.unwrap();
    assert_eq!(started["data"]["profileId"], "p-night");

    container.shutdown().await;
}

#[tokio::test]
async fn alias_and_case_insensitive_types_start() {
    let dir = tempfile::tempdir().unwrap();
    let container = ServiceContainer::new(ContainerConfig {
        config_base: dir.path().to_path_buf(),
        ..Default::default()
    });
    container.initialize().await.unwrap();
    container.start().await.unwrap();
    let supervisor = container.supervisor().unwrap();
    let ctx = CancellationToken::new();

    let inst = supervisor
        .start(&ctx, "SIMULATED", sim_config())
        .await
        .unwrap();
    assert_eq!(inst.kind(), "simulated");

    container.shutdown().await;
}
