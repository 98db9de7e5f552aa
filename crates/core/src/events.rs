//! Event model fanned out by the hub.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "miner.starting")]
    MinerStarting,
    #[serde(rename = "miner.started")]
    MinerStarted,
    #[serde(rename = "miner.stopping")]
    MinerStopping,
    #[serde(rename = "miner.stopped")]
    MinerStopped,
    #[serde(rename = "miner.stats")]
    MinerStats,
    #[serde(rename = "miner.error")]
    MinerError,
    #[serde(rename = "miner.connected")]
    MinerConnected,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "state.sync")]
    StateSync,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinerStarting => "miner.starting",
            Self::MinerStarted => "miner.started",
            Self::MinerStopping => "miner.stopping",
            Self::MinerStopped => "miner.stopped",
            Self::MinerStats => "miner.stats",
            Self::MinerError => "miner.error",
            Self::MinerConnected => "miner.connected",
            Self::Pong => "pong",
            Self::StateSync => "state.sync",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unix seconds.
    pub timestamp: u64,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: now_unix(),
            data,
        }
    }

    /// Instance name carried in the payload, when any.
    pub fn instance_name(&self) -> Option<&str> {
        self.data.get("name").and_then(|v| v.as_str())
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_dotted_type_tags() {
        let e = Event::new(
            EventType::MinerStarted,
            serde_json::json!({"name": "xmrig-rx/0"}),
        );
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "miner.started");
        assert_eq!(v["data"]["name"], "xmrig-rx/0");
        assert!(v["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn extracts_instance_name() {
        let e = Event::new(EventType::MinerStats, serde_json::json!({"name": "m1"}));
        assert_eq!(e.instance_name(), Some("m1"));
        let e = Event::new(EventType::Pong, serde_json::json!({}));
        assert_eq!(e.instance_name(), None);
    }

    #[test]
    fn round_trips_through_json() {
        let e = Event::new(EventType::StateSync, serde_json::json!({"miners": []}));
        let text = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event_type, EventType::StateSync);
    }
}
