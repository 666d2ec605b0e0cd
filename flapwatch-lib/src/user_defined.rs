use chrono::Utc;
use ipnet::IpNet;
use metrics::gauge;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, info};

use crate::config::DetectorConfig;
use crate::error::{Error, Result};
use crate::flap::{FlapRecord, FlapSnapshot};
use crate::path_history::PathHistory;
use crate::queue::QueueReceiver;
use crate::update::PathChange;

#[derive(Debug)]
struct UserDefinedRecord {
    record: FlapRecord,
    subscribers: u32,
}

/// Prefixes watched on request, regardless of their flap state.
#[derive(Debug, Clone)]
pub struct UserDefinedRegistry {
    records: Arc<RwLock<HashMap<IpNet, UserDefinedRecord>>>,
    limit: usize,
    max_path_history: usize,
    keep_path_info: bool,
}

impl UserDefinedRegistry {
    pub fn new(config: &DetectorConfig) -> UserDefinedRegistry {
        UserDefinedRegistry {
            records: Arc::new(RwLock::new(HashMap::new())),
            limit: config.max_user_defined,
            max_path_history: config.max_path_history,
            keep_path_info: config.keep_path_info,
        }
    }

    /// Adds a subscriber to `prefix` and returns its subscriber count.
    pub fn subscribe(&self, prefix: IpNet) -> Result<u32> {
        let mut records = self.records.write();

        if let Some(entry) = records.get_mut(&prefix) {
            entry.subscribers = entry.subscribers.saturating_add(1);
            return Ok(entry.subscribers);
        }

        if records.len() >= self.limit {
            return Err(Error::CapacityExceeded { limit: self.limit });
        }

        let history = PathHistory::with_recording(self.max_path_history, self.keep_path_info);
        records.insert(
            prefix,
            UserDefinedRecord {
                record: FlapRecord::new(prefix, Utc::now().timestamp(), 0, true, history),
                subscribers: 1,
            },
        );
        gauge!("flapwatch_user_defined_prefixes").set(records.len() as f64);
        info!("user-defined monitor added for {}", prefix);
        Ok(1)
    }

    /// Removes a subscriber from `prefix`. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, prefix: &IpNet) -> bool {
        let mut records = self.records.write();

        let Some(entry) = records.get_mut(prefix) else {
            return false;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            records.remove(prefix);
            gauge!("flapwatch_user_defined_prefixes").set(records.len() as f64);
            info!("user-defined monitor removed for {}", prefix);
        }
        true
    }

    /// Path changes seen for `prefix` since it was subscribed, zero if unknown.
    pub fn event_count(&self, prefix: &IpNet) -> u64 {
        self.records
            .read()
            .get(prefix)
            .map_or(0, |entry| entry.record.total_path_changes())
    }

    pub fn event(&self, prefix: &IpNet) -> Option<FlapSnapshot> {
        self.records
            .read()
            .get(prefix)
            .map(|entry| entry.record.snapshot())
    }

    pub fn subscribers(&self, prefix: &IpNet) -> u32 {
        self.records
            .read()
            .get(prefix)
            .map_or(0, |entry| entry.subscribers)
    }

    pub fn record_path_change(&self, change: &PathChange) {
        if let Some(entry) = self.records.write().get_mut(&change.prefix) {
            entry.record.record(change);
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Applies forwarded path changes to the registry until the queue closes.
pub async fn monitor_user_defined(
    registry: UserDefinedRegistry,
    mut rx: QueueReceiver<PathChange>,
    guard: ShutdownGuard,
) {
    loop {
        let change = tokio::select! {
            _ = guard.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        registry.record_path_change(&change);
    }
    debug!("user-defined monitor stopped");
}
