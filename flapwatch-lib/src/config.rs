use serde::Serialize;
use std::time::Duration;

use crate::error::{Error, Result};

/// Thresholds and limits of the flap detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorConfig {
    /// Path changes per interval needed to promote a prefix and to sustain it.
    /// Zero means every path change is reported.
    pub route_change_counter: u64,

    /// Path changes per interval at or below which a triggered flap decays.
    /// Zero means the same value as `route_change_counter`.
    pub expiry_route_change_counter: u64,

    /// Consecutive intervals above `route_change_counter` before a flap starts.
    pub over_threshold_target: u32,

    /// Consecutive intervals at or below `expiry_route_change_counter` before a flap ends.
    pub under_threshold_target: u32,

    /// Distinct AS paths kept per tracked prefix.
    pub max_path_history: usize,

    /// Maximum number of user-defined prefixes.
    pub max_user_defined: usize,

    /// Record AS paths at all.
    pub keep_path_info: bool,

    /// Length of one evaluation interval.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            route_change_counter: 600,
            expiry_route_change_counter: 0,
            over_threshold_target: 10,
            under_threshold_target: 15,
            max_path_history: 1000,
            max_user_defined: 5,
            keep_path_info: true,
            interval: Duration::from_secs(60),
        }
    }
}

impl DetectorConfig {
    /// Applies the implicit relations between thresholds and validates the result.
    pub fn normalize(mut self) -> Result<Self> {
        if self.route_change_counter == 0 {
            self.over_threshold_target = 0;
            self.under_threshold_target = 0;
        } else if self.over_threshold_target == 0 {
            self.under_threshold_target = 1;
        }

        if self.expiry_route_change_counter == 0 {
            self.expiry_route_change_counter = self.route_change_counter;
        }

        if self.expiry_route_change_counter > self.route_change_counter {
            return Err(Error::InvalidConfig(format!(
                "expiry route change counter ({}) is greater than route change counter ({})",
                self.expiry_route_change_counter, self.route_change_counter
            )));
        }

        if self.interval.is_zero() {
            return Err(Error::InvalidConfig("interval must not be zero".to_string()));
        }

        Ok(self)
    }

    /// Whether every path change is reported without thresholds.
    pub fn monitor_everything(&self) -> bool {
        self.route_change_counter == 0
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval.as_secs().max(1)
    }

    pub fn describe(&self) -> String {
        let interval = self.interval_secs();
        if self.monitor_everything() {
            format!(
                "trigger an alert for all route changes, remove entries after {}s of inactivity",
                interval
            )
        } else {
            format!(
                "trigger an alert after {} consecutive {}s intervals with > {} route changes; \
                 end alert after {} consecutive {}s intervals with <= {} route changes",
                self.over_threshold_target,
                interval,
                self.route_change_counter,
                self.under_threshold_target,
                interval,
                self.expiry_route_change_counter
            )
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
