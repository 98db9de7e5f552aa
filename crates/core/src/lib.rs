mod collector;
mod config;
mod container;
mod error;
mod events;
mod hub;
mod profiles;
mod ratelimit;
mod supervisor;

pub use collector::{collect_once, prune_once, StatsCollector};
pub use config::{
    config_base, miners_config_path, profiles_path, settings_path, BehaviorSettings,
    DatabaseSettings, MinerEntry, MinersDocument, PerformanceSettings, Profile, Settings,
    WindowSettings,
};
pub use container::{ContainerConfig, NodeService, ServiceContainer};
pub use error::{CoreError, ErrorBody, Result};
pub use events::{now_unix, Event, EventType};
pub use hub::{
    channel_transport, ChannelPeer, ChannelTransport, EventHub, EventSink, EventStream,
    HubConfig, PeerFrame, StateProvider, SubscriberTransport, TransportError, MAX_SUBSCRIBERS,
};
pub use profiles::ProfileStore;
pub use ratelimit::RateLimiter;
pub use supervisor::{Supervisor, SupervisorStateProvider};
