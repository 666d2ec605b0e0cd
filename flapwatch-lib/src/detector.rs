use ipnet::IpNet;
use metrics::{counter, gauge};
use parking_lot::RwLockUpgradableReadGuard;
use std::collections::HashMap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_graceful::ShutdownGuard;
use tracing::{debug, info, trace, warn};

use crate::flap::{FlapNotification, FlapRecord, Verdict};
use crate::path_history::PathHistory;
use crate::queue::{QueueReceiver, QueueSender};
use crate::state::FlapState;
use crate::update::PathChange;

/// Ticks after which the candidate map is reallocated to release the
/// capacity reached during bursts.
const CANDIDATES_RESET_TICKS: u64 = 30;

/// Flap detection engine.
///
/// Path changes are first counted per prefix within the current interval.
/// A prefix reaching the route change counter inside one interval gets a
/// [`FlapRecord`]; from then on every interval is evaluated by [`Detector::tick`].
#[derive(Debug)]
pub struct Detector {
    state: FlapState,
    candidates: HashMap<IpNet, u64>,
    ticks: u64,
    now: i64,
}

impl Detector {
    /// `now` is used as the first-seen time until the first tick.
    pub fn new(state: FlapState, now: i64) -> Detector {
        Detector {
            state,
            candidates: HashMap::new(),
            ticks: 0,
            now,
        }
    }

    pub fn state(&self) -> &FlapState {
        &self.state
    }

    pub fn record_path_change(&mut self, change: &PathChange) {
        counter!("flapwatch_path_changes_total").increment(1);

        if self.record_tracked(change) {
            return;
        }
        self.state.statistics().record_change(false);

        let config = self.state.config();
        let count = self.candidates.entry(change.prefix).or_insert(0);
        *count = count.saturating_add(1);
        if *count < config.route_change_counter {
            return;
        }

        let total = *count;
        self.candidates.remove(&change.prefix);
        let history = PathHistory::with_recording(config.max_path_history, config.keep_path_info);
        let record = FlapRecord::new(
            change.prefix,
            self.now,
            total,
            config.monitor_everything(),
            history,
        );
        record
            .path_history()
            .record(&change.previous_path, change.is_withdrawal);
        trace!("{} - tracking after {} path changes", change.prefix, total);
        self.state.flaps().write().insert(change.prefix, record);
    }

    /// Records the change into the prefix's record, if it has one. The write
    /// lock is only taken when there is a record to update.
    fn record_tracked(&self, change: &PathChange) -> bool {
        let flaps = self.state.flaps().upgradable_read();
        if !flaps.contains_key(&change.prefix) {
            return false;
        }

        let mut flaps = RwLockUpgradableReadGuard::upgrade(flaps);
        let Some(record) = flaps.get_mut(&change.prefix) else {
            return false;
        };
        record.record(change);
        self.state.statistics().record_change(record.is_triggered());
        true
    }

    /// Closes the current interval and returns the resulting notifications.
    pub fn tick(&mut self, now: i64) -> Vec<FlapNotification> {
        self.now = now;
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % CANDIDATES_RESET_TICKS == 0 {
            self.candidates = HashMap::new();
        } else {
            self.candidates.clear();
        }

        let config = self.state.config();
        let interval_secs = config.interval_secs();
        let mut notifications = Vec::new();

        let mut flaps = self.state.flaps().write();
        flaps.retain(|prefix, record| {
            let interval_count = record.close_interval(interval_secs);
            match record.evaluate(interval_count, config) {
                Verdict::Keep => true,
                Verdict::Discard => {
                    trace!("{} - no longer tracked", prefix);
                    false
                }
                Verdict::Started => {
                    counter!("flapwatch_notifications_total", "kind" => "start").increment(1);
                    notifications.push(FlapNotification {
                        is_start: true,
                        event: record.snapshot(),
                    });
                    true
                }
                Verdict::Ended => {
                    counter!("flapwatch_notifications_total", "kind" => "end").increment(1);
                    notifications.push(FlapNotification {
                        is_start: false,
                        event: record.snapshot(),
                    });
                    false
                }
            }
        });

        let active = flaps.values().filter(|r| r.is_triggered()).count();
        gauge!("flapwatch_tracked_prefixes").set(flaps.len() as f64);
        gauge!("flapwatch_active_flaps").set(active as f64);
        debug!(
            "interval closed: {} tracked, {} active, {} notifications",
            flaps.len(),
            active,
            notifications.len()
        );

        notifications
    }
}

/// Runs the detection engine until the path change queue closes or on shutdown.
///
/// Changes are forwarded to the user-defined queue only while at least one
/// prefix is subscribed. A notification batch that does not fit in the
/// notification queue is dropped as a whole.
pub async fn detect_flaps(
    mut detector: Detector,
    mut rx: QueueReceiver<PathChange>,
    user_defined: QueueSender<PathChange>,
    notifications: QueueSender<Vec<FlapNotification>>,
    guard: ShutdownGuard,
) {
    let period = detector.state().config().interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("flap detection started: {}", detector.state().config().describe());

    loop {
        let change = tokio::select! {
            _ = guard.cancelled() => break,
            _ = ticker.tick() => {
                let batch = detector.tick(chrono::Utc::now().timestamp());
                if !batch.is_empty() {
                    let size = batch.len();
                    if !notifications.offer(batch) {
                        counter!("flapwatch_notification_batches_dropped_total").increment(1);
                        warn!("notification queue full, dropped {} notifications", size);
                    }
                }
                continue;
            }
            change = rx.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        if !detector.state().user_defined().is_empty() {
            user_defined.offer(change.clone());
        }
        detector.record_path_change(&change);
    }

    debug!("flap detection stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;

    fn detector() -> Detector {
        let config = DetectorConfig {
            route_change_counter: 3,
            ..Default::default()
        }
        .normalize()
        .unwrap();
        Detector::new(FlapState::new(config), 1000)
    }

    fn change(prefix: &str, asn: u32) -> PathChange {
        PathChange {
            prefix: prefix.parse().unwrap(),
            is_withdrawal: false,
            previous_path: vec![65000, asn],
        }
    }

    #[test]
    fn test_candidates_counted_while_map_is_read() {
        let mut detector = detector();
        let flaps = detector.state().flaps().clone();

        // A reader holding the map does not block changes of untracked prefixes.
        let guard = flaps.read();
        detector.record_path_change(&change("192.0.2.0/24", 1));
        detector.record_path_change(&change("192.0.2.0/24", 2));
        assert!(guard.is_empty());
        drop(guard);

        assert_eq!(detector.candidates.len(), 1);
        detector.record_path_change(&change("192.0.2.0/24", 3));
        assert!(detector.candidates.is_empty());
        assert_eq!(flaps.read().len(), 1);
    }

    #[test]
    fn test_candidates_reallocated_periodically() {
        let mut detector = detector();

        for tick in 1..CANDIDATES_RESET_TICKS {
            for i in 0..64u8 {
                detector.record_path_change(&change(&format!("10.0.{}.0/24", i), 1));
            }
            detector.tick(1000 + tick as i64);
            assert!(detector.candidates.is_empty());
            assert!(detector.candidates.capacity() >= 64);
        }

        detector.tick(5000);
        assert_eq!(detector.candidates.capacity(), 0);
    }
}
