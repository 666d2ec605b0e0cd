use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::DetectorConfig;
use crate::path_history::{PathHistory, PathInfo};
use crate::update::PathChange;

/// Rate samples kept per record, one per interval.
pub const RATE_HISTORY_LEN: usize = 60;

/// Outcome of evaluating one interval of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep tracking, nothing to report.
    Keep,
    /// Not flapping enough to keep tracking; drop silently.
    Discard,
    /// The prefix crossed into the flapping state.
    Started,
    /// The flap has calmed down; drop and report.
    Ended,
}

/// Tracking state of one prefix.
#[derive(Debug)]
pub struct FlapRecord {
    pub prefix: IpNet,
    pub first_seen: i64,
    total_path_changes: u64,
    last_interval_count: u64,
    rate_sec: Option<f64>,
    rate_sec_history: VecDeque<f64>,
    over_threshold_count: u32,
    under_threshold_count: u32,
    triggered: bool,
    path_history: PathHistory,
}

impl FlapRecord {
    pub fn new(
        prefix: IpNet,
        first_seen: i64,
        total_path_changes: u64,
        triggered: bool,
        path_history: PathHistory,
    ) -> FlapRecord {
        FlapRecord {
            prefix,
            first_seen,
            total_path_changes,
            last_interval_count: 0,
            rate_sec: None,
            rate_sec_history: VecDeque::with_capacity(RATE_HISTORY_LEN),
            over_threshold_count: 1,
            under_threshold_count: 0,
            triggered,
            path_history,
        }
    }

    /// Counts a path change and remembers the path it replaced.
    pub fn record(&mut self, change: &PathChange) {
        self.total_path_changes = self.total_path_changes.saturating_add(1);
        self.path_history
            .record(&change.previous_path, change.is_withdrawal);
    }

    /// Closes the current interval and returns the number of changes seen in it.
    pub fn close_interval(&mut self, interval_secs: u64) -> u64 {
        let interval_count = self
            .total_path_changes
            .saturating_sub(self.last_interval_count);
        let rate = interval_count as f64 / interval_secs.max(1) as f64;

        self.rate_sec = Some(rate);
        if self.rate_sec_history.len() == RATE_HISTORY_LEN {
            self.rate_sec_history.pop_front();
        }
        self.rate_sec_history.push_back(rate);
        self.last_interval_count = self.total_path_changes;

        interval_count
    }

    /// Advances the hysteresis state machine by one interval.
    pub fn evaluate(&mut self, interval_count: u64, config: &DetectorConfig) -> Verdict {
        if interval_count <= config.route_change_counter {
            if !self.triggered {
                return Verdict::Discard;
            }
            // Between the expiry and the route change counter the decay
            // counter neither advances nor resets.
            if interval_count <= config.expiry_route_change_counter {
                self.under_threshold_count = self.under_threshold_count.saturating_add(1);
                if self.under_threshold_count >= config.under_threshold_target {
                    return Verdict::Ended;
                }
            }
            return Verdict::Keep;
        }

        self.under_threshold_count = 0;
        if !self.triggered && self.over_threshold_count >= config.over_threshold_target {
            self.triggered = true;
            return Verdict::Started;
        }
        self.over_threshold_count = self.over_threshold_count.saturating_add(1);
        Verdict::Keep
    }

    pub fn total_path_changes(&self) -> u64 {
        self.total_path_changes
    }

    pub fn rate_sec(&self) -> Option<f64> {
        self.rate_sec
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn path_history(&self) -> &PathHistory {
        &self.path_history
    }

    /// Deep copy safe to hand out while the record keeps changing.
    pub fn snapshot(&self) -> FlapSnapshot {
        FlapSnapshot {
            prefix: self.prefix,
            first_seen: self.first_seen,
            total_path_changes: self.total_path_changes,
            rate_sec: self.rate_sec,
            rate_sec_history: self.rate_sec_history.iter().copied().collect(),
            paths: self.path_history.all(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlapSnapshot {
    pub prefix: IpNet,
    pub first_seen: i64,
    pub total_path_changes: u64,
    pub rate_sec: Option<f64>,
    pub rate_sec_history: Vec<f64>,
    pub paths: Vec<PathInfo>,
}

impl FlapSnapshot {
    pub fn summary(&self) -> FlapSummary {
        FlapSummary {
            prefix: self.prefix,
            first_seen: self.first_seen,
            rate_sec: self.rate_sec,
            total_count: self.total_path_changes,
        }
    }

    /// Same event without the path history.
    pub fn without_paths(&self) -> FlapSnapshot {
        FlapSnapshot {
            paths: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlapSummary {
    pub prefix: IpNet,
    pub first_seen: i64,
    pub rate_sec: Option<f64>,
    pub total_count: u64,
}

/// Start or end of a flap, as delivered to notification sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlapNotification {
    pub is_start: bool,
    pub event: FlapSnapshot,
}
