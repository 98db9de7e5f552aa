//! Persisted configuration documents and their on-disk layout.

use openminerd_miner_adapters::MinerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Base directory for all persisted documents:
/// `<config_dir>/openminerd`.
pub fn config_base() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("openminerd")
}

pub fn miners_config_path(base: &std::path::Path) -> PathBuf {
    base.join("miners").join("config.json")
}

pub fn profiles_path(base: &std::path::Path) -> PathBuf {
    base.join("mining_profiles.json")
}

pub fn settings_path(base: &std::path::Path) -> PathBuf {
    base.join("settings.json")
}

/// One autostart entry per miner type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerEntry {
    pub miner_type: String,
    pub autostart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MinerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSettings {
    pub enabled: bool,
    pub retention_days: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_days: 30,
        }
    }
}

/// `<config>/miners/config.json`: autostart list plus retention knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinersDocument {
    #[serde(default)]
    pub miners: Vec<MinerEntry>,
    #[serde(default)]
    pub database: DatabaseSettings,
}

impl MinersDocument {
    /// Upsert the entry for `miner_type`.
    pub fn set_autostart(&mut self, miner_type: &str, autostart: bool, config: Option<MinerConfig>) {
        match self.miners.iter_mut().find(|m| m.miner_type == miner_type) {
            Some(entry) => {
                entry.autostart = autostart;
                if config.is_some() {
                    entry.config = config;
                }
            }
            None => self.miners.push(MinerEntry {
                miner_type: miner_type.to_string(),
                autostart,
                config,
            }),
        }
    }

    pub fn remove(&mut self, miner_type: &str) {
        self.miners.retain(|m| m.miner_type != miner_type);
    }
}

/// Saved mining profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub miner_type: String,
    pub config: MinerConfig,
}

/// `<config>/settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub window: WindowSettings,
    #[serde(default)]
    pub behavior: BehaviorSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSettings {
    pub width: u32,
    pub height: u32,
    pub start_minimized: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            width: 1100,
            height: 720,
            start_minimized: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorSettings {
    /// Stop all miners when the daemon exits.
    pub quit_stops_mining: bool,
    /// Start autostart-flagged miners on boot.
    pub autostart_on_launch: bool,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            quit_stops_mining: true,
            autostart_on_launch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSettings {
    /// Echo miner output to the daemon console.
    pub echo_miner_output: bool,
    pub max_log_lines: usize,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            echo_miner_output: false,
            max_log_lines: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miners_document_round_trips_wire_names() {
        let mut doc = MinersDocument::default();
        doc.set_autostart("xmrig", true, None);
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["miners"][0]["minerType"], "xmrig");
        assert_eq!(v["database"]["retentionDays"], 30);
        let back: MinersDocument = serde_json::from_value(v).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn set_autostart_upserts() {
        let mut doc = MinersDocument::default();
        doc.set_autostart("xmrig", true, None);
        doc.set_autostart("xmrig", false, None);
        assert_eq!(doc.miners.len(), 1);
        assert!(!doc.miners[0].autostart);
        doc.remove("xmrig");
        assert!(doc.miners.is_empty());
    }

    #[test]
    fn settings_defaults_are_sensible() {
        let s = Settings::default();
        assert!(s.behavior.quit_stops_mining);
        assert_eq!(s.performance.max_log_lines, 500);
    }
}
