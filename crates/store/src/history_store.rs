//! Persistence seam for hashrate points.
//!
//! The supervisor records samples through this trait; a durable backend
//! (SQLite in production) lives outside this workspace. When the database
//! is disabled the no-op implementation is substituted and history stays
//! in memory only.

use crate::{HashratePoint, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Retention tier a point belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    High,
    Low,
}

/// Aggregate stats for one instance, as reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStats {
    pub instance: String,
    pub miner_type: String,
    pub point_count: u64,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub max_hashrate: u64,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_point(
        &self,
        instance: &str,
        miner_type: &str,
        point: HashratePoint,
        resolution: Resolution,
    ) -> Result<()>;

    async fn get_stats(&self, instance: &str) -> Result<InstanceStats>;

    async fn get_points(
        &self,
        instance: &str,
        resolution: Resolution,
        since: u64,
        until: u64,
    ) -> Result<Vec<HashratePoint>>;

    async fn get_all_stats(&self) -> Result<Vec<InstanceStats>>;

    /// Drop points older than `cutoff` (unix seconds). Used by the hourly
    /// retention task.
    async fn prune_before(&self, cutoff: u64) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

/// Substituted when persistence is disabled.
pub struct NoopHistoryStore;

#[async_trait]
impl HistoryStore for NoopHistoryStore {
    async fn insert_point(
        &self,
        _instance: &str,
        _miner_type: &str,
        _point: HashratePoint,
        _resolution: Resolution,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_stats(&self, instance: &str) -> Result<InstanceStats> {
        Ok(InstanceStats {
            instance: instance.to_string(),
            ..Default::default()
        })
    }

    async fn get_points(
        &self,
        _instance: &str,
        _resolution: Resolution,
        _since: u64,
        _until: u64,
    ) -> Result<Vec<HashratePoint>> {
        Ok(Vec::new())
    }

    async fn get_all_stats(&self) -> Result<Vec<InstanceStats>> {
        Ok(Vec::new())
    }

    async fn prune_before(&self, _cutoff: u64) -> Result<u64> {
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_store_accepts_everything() {
        let store = NoopHistoryStore;
        store
            .insert_point("xmrig-rx/0", "xmrig", HashratePoint::new(100, 1200), Resolution::High)
            .await
            .unwrap();
        assert!(store.get_points("xmrig-rx/0", Resolution::High, 0, u64::MAX).await.unwrap().is_empty());
        assert_eq!(store.prune_before(u64::MAX).await.unwrap(), 0);
        store.close().await.unwrap();
    }
}
