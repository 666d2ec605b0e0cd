use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, trace};

use crate::flap::FlapSummary;
use crate::state::FlapState;

/// Seconds between two samples.
pub const SAMPLE_INTERVAL_SECS: u64 = 5;

/// Samples kept, oldest first.
pub const MAX_SAMPLES: usize = 50;

/// Active flaps kept in the cached summary list.
pub const MAX_SUMMARIES: usize = 100;

pub type AsyncStatistics = Arc<Statistics>;

pub fn new_statistics() -> AsyncStatistics {
    Arc::new(Statistics::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub time: i64,
    pub changes: u64,
    pub listed_changes: u64,
    pub tracked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub active_flap_count: usize,
    pub active_flap_total_path_change_count: u64,
    pub total_path_change_count: u64,
    pub average_route_changes_90: f64,
    pub sessions: usize,
}

#[derive(Debug, Default)]
pub struct Statistics {
    changes: AtomicU64,
    listed_changes: AtomicU64,
    samples: RwLock<VecDeque<Sample>>,
    summaries: RwLock<Vec<FlapSummary>>,
}

impl Statistics {
    /// Counts one path change. `listed` is set when the prefix is an active flap.
    pub fn record_change(&self, listed: bool) {
        self.changes.fetch_add(1, Ordering::Relaxed);
        if listed {
            self.listed_changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Closes the current sampling period.
    pub fn sample(&self, time: i64, tracked: usize, mut summaries: Vec<FlapSummary>) -> Sample {
        summaries.sort_by(|a, b| b.total_count.cmp(&a.total_count));
        summaries.truncate(MAX_SUMMARIES);
        *self.summaries.write() = summaries;

        let sample = Sample {
            time,
            changes: self.changes.swap(0, Ordering::Relaxed),
            listed_changes: self.listed_changes.swap(0, Ordering::Relaxed),
            tracked,
        };

        let mut samples = self.samples.write();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(sample);
        sample
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.read().iter().copied().collect()
    }

    /// Active flaps as of the latest sample, busiest first.
    pub fn active_summaries(&self) -> Vec<FlapSummary> {
        self.summaries.read().clone()
    }

    /// Average path changes per second over the calmest 90% of samples.
    pub fn average_route_changes_90(&self) -> f64 {
        let mut changes: Vec<u64> = self.samples.read().iter().map(|s| s.changes).collect();
        if changes.is_empty() {
            return 0.0;
        }
        changes.sort_unstable();
        let keep = (changes.len() as f64 * 0.9).ceil() as usize;
        changes.truncate(keep);

        let sum: u64 = changes.iter().fold(0, |acc, c| acc.saturating_add(*c));
        sum as f64 / changes.len() as f64 / SAMPLE_INTERVAL_SECS as f64
    }

    pub fn metric(&self, sessions: usize) -> Metric {
        let latest = self.samples.read().back().copied();
        Metric {
            active_flap_count: latest.map_or(0, |s| s.tracked),
            active_flap_total_path_change_count: latest.map_or(0, |s| s.listed_changes),
            total_path_change_count: latest.map_or(0, |s| s.changes),
            average_route_changes_90: self.average_route_changes_90(),
            sessions,
        }
    }
}

/// Samples the pipeline every few seconds until shutdown.
pub async fn sample_statistics(state: FlapState, guard: ShutdownGuard) {
    let period = Duration::from_secs(SAMPLE_INTERVAL_SECS);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = guard.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let active = state.active_flaps();
        let summaries = active.flaps.iter().map(|flap| flap.summary()).collect();
        let sample = state
            .statistics()
            .sample(Utc::now().timestamp(), active.tracked, summaries);
        trace!("statistics sample: {:?}", sample);
    }

    debug!("statistics sampler stopped");
}
