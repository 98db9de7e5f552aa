//! Publish/subscribe hub multiplexing lifecycle and stats events to
//! connected observers.
//!
//! A single owner loop holds the subscriber set; registration,
//! unregistration, broadcast and stop all arrive over channels, so no lock
//! ordering exists between subscribers. Each subscriber gets a bounded
//! queue: a consumer that cannot keep up is unregistered rather than
//! allowed to stall the loop or starve its peers.

use crate::events::{Event, EventType};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, warn};

pub const MAX_SUBSCRIBERS: usize = 100;
const BROADCAST_BUFFER: usize = 256;
const SUBSCRIBER_QUEUE: usize = 256;
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const MAX_FRAME_BYTES: usize = 512;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// Outbound half of a subscriber connection.
#[async_trait]
pub trait EventSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    async fn send_ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self, reason: &str);
}

/// Inbound half; yields client frames until the connection dies.
#[async_trait]
pub trait EventStream: Send {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// A connected observer's transport, split into cooperating halves the way
/// a WebSocket splits into sink and stream.
pub trait SubscriberTransport: Send {
    fn split(self: Box<Self>) -> (Box<dyn EventSink>, Box<dyn EventStream>);
}

/// Builds the `state.sync` snapshot pushed to freshly registered
/// subscribers.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn state_sync(&self) -> Event;
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_subscribers: usize,
    pub subscriber_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_subscribers: MAX_SUBSCRIBERS,
            subscriber_queue: SUBSCRIBER_QUEUE,
        }
    }
}

struct Subscriber {
    queue: mpsc::Sender<Arc<str>>,
    filter: Arc<Mutex<HashSet<String>>>,
    closed: Arc<AtomicBool>,
}

enum Command {
    Register(u64, Subscriber),
    Unregister(u64),
    Stop,
}

pub struct EventHub {
    config: HubConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    broadcast_tx: mpsc::Sender<Event>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    client_count: Arc<AtomicUsize>,
    next_id: AtomicU64,
    state_provider: Arc<RwLock<Option<Arc<dyn StateProvider>>>>,
    stopped: AtomicBool,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);
        Arc::new(Self {
            config,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
            client_count: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            state_provider: Arc::new(RwLock::new(None)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the owner loop. Called once by the container; subscriptions
    /// and broadcasts issued earlier queue up until the loop drains them.
    pub fn spawn_loop(self: &Arc<Self>) {
        let cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let broadcast_rx = self
            .broadcast_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (Some(cmd_rx), Some(broadcast_rx)) = (cmd_rx, broadcast_rx) else {
            warn!("event hub loop already running");
            return;
        };
        let hub = self.clone();
        tokio::spawn(async move {
            hub.run(cmd_rx, broadcast_rx).await;
        });
    }

    pub fn set_state_provider(&self, provider: Option<Arc<dyn StateProvider>>) {
        *self
            .state_provider
            .write()
            .unwrap_or_else(|e| e.into_inner()) = provider;
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Publish an event. Never blocks and never fails the publisher: when
    /// the broadcast buffer is saturated the event is dropped with a
    /// warning.
    pub fn broadcast(&self, event: Event) {
        match self.broadcast_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(e)) => {
                warn!("event hub buffer full, dropping {}", e.event_type);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event hub stopped, dropping event");
            }
        }
    }

    /// Attach a new observer with the hub's default queue capacity.
    pub async fn subscribe(&self, transport: Box<dyn SubscriberTransport>) -> bool {
        self.subscribe_with_queue(transport, self.config.subscriber_queue)
            .await
    }

    /// Attach a new observer. Over-capacity connections are refused with a
    /// close reason before any subscriber task is spawned.
    pub async fn subscribe_with_queue(
        &self,
        transport: Box<dyn SubscriberTransport>,
        queue_capacity: usize,
    ) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            let (mut sink, _stream) = transport.split();
            sink.close("shutting down").await;
            return false;
        }

        let admitted = self
            .client_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                if count >= self.config.max_subscribers {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .is_ok();
        if !admitted {
            let (mut sink, _stream) = transport.split();
            sink.close("subscriber limit reached, try again later").await;
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (queue_tx, queue_rx) = mpsc::channel::<Arc<str>>(queue_capacity.max(1));
        let filter: Arc<Mutex<HashSet<String>>> =
            Arc::new(Mutex::new(HashSet::from(["*".to_string()])));

        let subscriber = Subscriber {
            queue: queue_tx,
            filter: filter.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let (sink, stream) = transport.split();
        tokio::spawn(write_pump(id, sink, queue_rx, self.cmd_tx.clone()));
        tokio::spawn(read_pump(
            id,
            stream,
            filter,
            self.cmd_tx.clone(),
            self.broadcast_tx.clone(),
        ));

        if self.cmd_tx.send(Command::Register(id, subscriber)).is_err() {
            self.client_count.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Idempotent shutdown: closes every subscriber and exits the loop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Stop);
    }

    async fn run(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut broadcast_rx: mpsc::Receiver<Event>,
    ) {
        let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(Command::Register(id, sub)) => {
                        self.push_state_sync(&sub);
                        subscribers.insert(id, sub);
                    }
                    Some(Command::Unregister(id)) => {
                        self.remove(&mut subscribers, id);
                    }
                    Some(Command::Stop) => {
                        for (_, sub) in subscribers.drain() {
                            sub.closed.swap(true, Ordering::SeqCst);
                        }
                        self.client_count.store(0, Ordering::SeqCst);
                        break;
                    }
                },
                event = broadcast_rx.recv() => match event {
                    None => break,
                    Some(event) => self.deliver(&mut subscribers, &event),
                },
            }
        }
        debug!("event hub loop exited");
    }

    fn remove(&self, subscribers: &mut HashMap<u64, Subscriber>, id: u64) {
        if let Some(sub) = subscribers.remove(&id) {
            // The once-flag tolerates unregister arriving from both pumps.
            if !sub.closed.swap(true, Ordering::SeqCst) {
                self.client_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn deliver(&self, subscribers: &mut HashMap<u64, Subscriber>, event: &Event) {
        let Ok(text) = serde_json::to_string(event) else {
            error!("unserializable event {}", event.event_type);
            return;
        };
        let payload: Arc<str> = text.into();

        let mut expelled: Vec<u64> = Vec::new();
        for (id, sub) in subscribers.iter() {
            if !should_deliver(sub, event) {
                continue;
            }
            match sub.queue.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscriber {} cannot keep up, unregistering", id);
                    expelled.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => expelled.push(*id),
            }
        }
        for id in expelled {
            self.remove(subscribers, id);
        }
    }

    /// One-shot snapshot push for a fresh subscriber. A panicking provider
    /// is contained in its own task and logged.
    fn push_state_sync(&self, sub: &Subscriber) {
        let provider = self
            .state_provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(provider) = provider else { return };
        let queue = sub.queue.clone();
        let task = tokio::spawn(async move {
            let event = provider.state_sync().await;
            if let Ok(text) = serde_json::to_string(&event) {
                // Never blocks; a full queue drops the snapshot.
                let _ = queue.try_send(text.into());
            }
        });
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("state sync task panicked");
                }
            }
        });
    }
}

fn should_deliver(sub: &Subscriber, event: &Event) -> bool {
    if event.event_type == EventType::Pong {
        return true;
    }
    match event.instance_name() {
        None => true,
        Some("") => true,
        Some(name) => {
            let filter = sub.filter.lock().unwrap_or_else(|e| e.into_inner());
            filter.contains("*") || filter.contains(name)
        }
    }
}

async fn write_pump(
    id: u64,
    mut sink: Box<dyn EventSink>,
    mut queue_rx: mpsc::Receiver<Arc<str>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_PERIOD, KEEPALIVE_PERIOD);
    loop {
        tokio::select! {
            msg = queue_rx.recv() => match msg {
                Some(text) => match timeout(WRITE_DEADLINE, sink.send_text(&text)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        let _ = cmd_tx.send(Command::Unregister(id));
                        break;
                    }
                },
                // Queue closed by the hub: orderly goodbye.
                None => {
                    sink.close("goodbye").await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if sink.send_ping().await.is_err() {
                    let _ = cmd_tx.send(Command::Unregister(id));
                    break;
                }
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    miners: Vec<String>,
}

async fn read_pump(
    id: u64,
    mut stream: Box<dyn EventStream>,
    filter: Arc<Mutex<HashSet<String>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    broadcast_tx: mpsc::Sender<Event>,
) {
    loop {
        match timeout(READ_DEADLINE, stream.next_frame()).await {
            // Deadline expired without any frame (keepalive pongs refresh it).
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => {
                if frame.len() > MAX_FRAME_BYTES {
                    warn!("subscriber {} sent oversize frame", id);
                    break;
                }
                let Ok(msg) = serde_json::from_str::<ControlMessage>(&frame) else {
                    continue;
                };
                match msg.kind.as_str() {
                    "subscribe" => {
                        let mut f = filter.lock().unwrap_or_else(|e| e.into_inner());
                        f.clear();
                        f.extend(msg.miners);
                    }
                    "ping" => {
                        let _ = broadcast_tx
                            .try_send(Event::new(EventType::Pong, serde_json::json!({})));
                    }
                    // Keepalive reply; the deadline reset above is enough.
                    "pong" => {}
                    other => debug!("subscriber {} sent unknown control '{}'", id, other),
                }
            }
        }
    }
    let _ = cmd_tx.send(Command::Unregister(id));
}

// ---------------------------------------------------------------------------
// In-memory transport, used by tests and embedded observers.

/// Frame observed by the test peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    Text(String),
    Ping,
    Close(String),
}

/// Server side of an in-memory duplex connection.
pub struct ChannelTransport {
    out_tx: mpsc::Sender<PeerFrame>,
    in_rx: mpsc::Receiver<String>,
}

/// Client side handed to the test: read server frames, write control
/// messages.
pub struct ChannelPeer {
    pub frames: mpsc::Receiver<PeerFrame>,
    pub control: mpsc::Sender<String>,
}

pub fn channel_transport(buffer: usize) -> (ChannelTransport, ChannelPeer) {
    let (out_tx, out_rx) = mpsc::channel(buffer);
    let (in_tx, in_rx) = mpsc::channel(buffer);
    (
        ChannelTransport { out_tx, in_rx },
        ChannelPeer {
            frames: out_rx,
            control: in_tx,
        },
    )
}

struct ChannelSink {
    out_tx: mpsc::Sender<PeerFrame>,
}

struct ChannelStream {
    in_rx: mpsc::Receiver<String>,
}

impl SubscriberTransport for ChannelTransport {
    fn split(self: Box<Self>) -> (Box<dyn EventSink>, Box<dyn EventStream>) {
        (
            Box::new(ChannelSink { out_tx: self.out_tx }),
            Box::new(ChannelStream { in_rx: self.in_rx }),
        )
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.out_tx
            .send(PeerFrame::Text(text.to_string()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.out_tx
            .send(PeerFrame::Ping)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, reason: &str) {
        let _ = self.out_tx.send(PeerFrame::Close(reason.to_string())).await;
    }
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.in_rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_event(name: &str) -> Event {
        Event::new(
            EventType::MinerStats,
            serde_json::json!({"name": name, "hashrate": 1000}),
        )
    }

    async fn recv_text(peer: &mut ChannelPeer) -> Option<String> {
        loop {
            match timeout(Duration::from_secs(2), peer.frames.recv()).await.ok()?? {
                PeerFrame::Text(t) => return Some(t),
                PeerFrame::Ping => continue,
                PeerFrame::Close(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        let (transport, mut peer) = channel_transport(16);
        assert!(hub.subscribe(Box::new(transport)).await);

        hub.broadcast(stats_event("m1"));
        let text = recv_text(&mut peer).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "miner.stats");
        assert_eq!(v["data"]["name"], "m1");
        assert_eq!(hub.client_count(), 1);
        hub.stop();
    }

    #[tokio::test]
    async fn subscribe_control_replaces_filter() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        let (transport, mut peer) = channel_transport(16);
        hub.subscribe(Box::new(transport)).await;

        peer.control
            .send(r#"{"type":"subscribe","miners":["m2"]}"#.to_string())
            .await
            .unwrap();
        // Give the read pump a beat to apply the filter.
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.broadcast(stats_event("m1"));
        hub.broadcast(stats_event("m2"));
        let text = recv_text(&mut peer).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["data"]["name"], "m2");
        hub.stop();
    }

    #[tokio::test]
    async fn ping_elicits_pong() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        let (transport, mut peer) = channel_transport(16);
        hub.subscribe(Box::new(transport)).await;

        peer.control
            .send(r#"{"type":"ping"}"#.to_string())
            .await
            .unwrap();
        let text = recv_text(&mut peer).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "pong");
        hub.stop();
    }

    #[tokio::test]
    async fn slow_consumer_is_expelled_without_starving_others() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();

        // Slow: queue of one, tiny transport buffer, never read.
        let (slow_transport, _slow_peer) = channel_transport(1);
        hub.subscribe_with_queue(Box::new(slow_transport), 1).await;
        // Healthy subscriber with room for the whole burst.
        let (ok_transport, mut ok_peer) = channel_transport(8192);
        hub.subscribe_with_queue(Box::new(ok_transport), 8192).await;
        assert_eq!(hub.client_count(), 2);

        for i in 0..5000 {
            hub.broadcast(stats_event(&format!("m{}", i % 3)));
            // Let the loop drain so the broadcast buffer itself stays ahead.
            if i % 32 == 0 {
                tokio::task::yield_now().await;
            }
        }
        // The healthy peer keeps receiving.
        assert!(recv_text(&mut ok_peer).await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hub.client_count(), 1);
        hub.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_with_reason() {
        let hub = EventHub::new(HubConfig {
            max_subscribers: 1,
            ..Default::default()
        });
        hub.spawn_loop();

        let (t1, _p1) = channel_transport(16);
        assert!(hub.subscribe(Box::new(t1)).await);
        let (t2, mut p2) = channel_transport(16);
        assert!(!hub.subscribe(Box::new(t2)).await);

        match p2.frames.recv().await {
            Some(PeerFrame::Close(reason)) => assert!(reason.contains("try again later")),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(hub.client_count(), 1);
        hub.stop();
    }

    #[tokio::test]
    async fn state_sync_pushed_on_register() {
        struct FixedState;
        #[async_trait]
        impl StateProvider for FixedState {
            async fn state_sync(&self) -> Event {
                Event::new(
                    EventType::StateSync,
                    serde_json::json!({"miners": [{"name": "m1", "status": "running"}]}),
                )
            }
        }

        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        hub.set_state_provider(Some(Arc::new(FixedState)));

        let (transport, mut peer) = channel_transport(16);
        hub.subscribe(Box::new(transport)).await;
        let text = recv_text(&mut peer).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "state.sync");
        assert_eq!(v["data"]["miners"][0]["name"], "m1");
        hub.stop();
    }

    #[tokio::test]
    async fn panicking_state_provider_is_contained() {
        struct Exploding;
        #[async_trait]
        impl StateProvider for Exploding {
            async fn state_sync(&self) -> Event {
                panic!("state provider exploded");
            }
        }

        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        hub.set_state_provider(Some(Arc::new(Exploding)));

        let (transport, mut peer) = channel_transport(16);
        assert!(hub.subscribe(Box::new(transport)).await);
        // Hub still works for regular traffic.
        hub.broadcast(stats_event("m1"));
        let text = recv_text(&mut peer).await.unwrap();
        assert!(text.contains("miner.stats"));
        hub.stop();
    }

    #[tokio::test]
    async fn oversize_control_frame_disconnects() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        let (transport, peer) = channel_transport(16);
        hub.subscribe(Box::new(transport)).await;

        let big = format!(r#"{{"type":"subscribe","miners":["{}"]}}"#, "x".repeat(600));
        peer.control.send(big).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.client_count(), 0);
        hub.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        hub.stop();
        hub.stop();
        // Late broadcasts are dropped silently.
        hub.broadcast(stats_event("m1"));
    }

    #[tokio::test]
    async fn events_without_names_reach_filtered_subscribers() {
        let hub = EventHub::new(HubConfig::default());
        hub.spawn_loop();
        let (transport, mut peer) = channel_transport(16);
        hub.subscribe(Box::new(transport)).await;
        peer.control
            .send(r#"{"type":"subscribe","miners":["only-this"]}"#.to_string())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.broadcast(Event::new(EventType::StateSync, serde_json::json!({"miners": []})));
        let text = recv_text(&mut peer).await.unwrap();
        assert!(text.contains("state.sync"));
        hub.stop();
    }
}
