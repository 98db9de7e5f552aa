//! Two-tier rolling hashrate history.
//!
//! High-res points arrive at collector cadence and live for five minutes;
//! on eviction they are folded into per-minute means retained for a day.

use openminerd_store::HashratePoint;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const HIGH_RES_INTERVAL_SECS: u64 = 10;
pub const HIGH_RES_WINDOW_SECS: u64 = 5 * 60;
pub const LOW_RES_INTERVAL_SECS: u64 = 60;
pub const LOW_RES_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Shrink threshold: release backing memory once capacity is both above
/// this and more than twice the live length.
const SHRINK_CAP: usize = 1000;

struct Inner {
    high: Vec<HashratePoint>,
    low: Vec<HashratePoint>,
    last_reduce: u64,
}

pub struct HashrateHistory {
    inner: Mutex<Inner>,
}

impl HashrateHistory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                high: Vec::new(),
                low: Vec::new(),
                last_reduce: 0,
            }),
        }
    }

    pub fn add(&self, point: HashratePoint) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.high.push(point);
    }

    /// Fold expired high-res points into per-minute aggregates. Runs at most
    /// once per `LOW_RES_INTERVAL_SECS`; extra calls are no-ops.
    pub fn reduce(&self, now: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.last_reduce != 0 && now < inner.last_reduce + LOW_RES_INTERVAL_SECS {
            return;
        }
        inner.last_reduce = now;

        let cutoff = now.saturating_sub(HIGH_RES_WINDOW_SECS);
        let (to_aggregate, keep): (Vec<_>, Vec<_>) =
            inner.high.iter().copied().partition(|p| p.timestamp < cutoff);
        inner.high = keep;

        if !to_aggregate.is_empty() {
            // minute -> (sum, count); BTreeMap keeps the batch time-ordered.
            let mut buckets: BTreeMap<u64, (u64, u64)> = BTreeMap::new();
            for p in &to_aggregate {
                let minute = p.timestamp - p.timestamp % LOW_RES_INTERVAL_SECS;
                let entry = buckets.entry(minute).or_insert((0, 0));
                entry.0 += p.hashrate;
                entry.1 += 1;
            }
            for (minute, (sum, count)) in buckets {
                inner.low.push(HashratePoint::new(minute, sum / count));
            }
        }

        let low_cutoff = now.saturating_sub(LOW_RES_WINDOW_SECS);
        inner.low.retain(|p| p.timestamp >= low_cutoff);

        shrink(&mut inner.high);
        shrink(&mut inner.low);
    }

    /// Low-res tier followed by the high-res tail, both time-ordered.
    pub fn snapshot(&self) -> Vec<HashratePoint> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(inner.low.len() + inner.high.len());
        out.extend_from_slice(&inner.low);
        out.extend_from_slice(&inner.high);
        out
    }

    pub fn high_res_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).high.len()
    }

    pub fn low_res_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).low.len()
    }
}

impl Default for HashrateHistory {
    fn default() -> Self {
        Self::new()
    }
}

fn shrink(v: &mut Vec<HashratePoint>) {
    if v.capacity() > SHRINK_CAP && v.capacity() > 2 * v.len() {
        v.shrink_to_fit();
    }
}
