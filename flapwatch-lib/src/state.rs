use ipnet::IpNet;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DetectorConfig;
use crate::error::Result;
use crate::flap::{FlapRecord, FlapSnapshot};
use crate::statistics::{new_statistics, AsyncStatistics};
use crate::user_defined::UserDefinedRegistry;

pub type FlapMap = Arc<RwLock<HashMap<IpNet, FlapRecord>>>;

/// Currently flapping prefixes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveFlaps {
    /// Triggered records, busiest first.
    pub flaps: Vec<FlapSnapshot>,
    /// Every tracked record, triggered or not.
    pub tracked: usize,
}

/// Shared pipeline state and the read side of it handed to the API.
///
/// Only the detection loop mutates the flap map. Readers get deep copies
/// taken under the read lock and never see records that have not triggered.
#[derive(Debug, Clone)]
pub struct FlapState {
    config: Arc<DetectorConfig>,
    flaps: FlapMap,
    user_defined: UserDefinedRegistry,
    statistics: AsyncStatistics,
}

impl FlapState {
    pub fn new(config: DetectorConfig) -> FlapState {
        let user_defined = UserDefinedRegistry::new(&config);
        FlapState {
            config: Arc::new(config),
            flaps: Arc::new(RwLock::new(HashMap::new())),
            user_defined,
            statistics: new_statistics(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn statistics(&self) -> &AsyncStatistics {
        &self.statistics
    }

    pub fn user_defined(&self) -> &UserDefinedRegistry {
        &self.user_defined
    }

    pub(crate) fn flaps(&self) -> &FlapMap {
        &self.flaps
    }

    pub fn active_flaps(&self) -> ActiveFlaps {
        let flaps = self.flaps.read();
        let mut active: Vec<FlapSnapshot> = flaps
            .values()
            .filter(|record| record.is_triggered())
            .map(FlapRecord::snapshot)
            .collect();
        let tracked = flaps.len();
        drop(flaps);

        active.sort_by(|a, b| {
            b.total_path_changes
                .cmp(&a.total_path_changes)
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        ActiveFlaps {
            flaps: active,
            tracked,
        }
    }

    /// Snapshot of `prefix` if it is an active flap.
    pub fn flap(&self, prefix: &IpNet) -> Option<FlapSnapshot> {
        self.flaps
            .read()
            .get(prefix)
            .filter(|record| record.is_triggered())
            .map(FlapRecord::snapshot)
    }

    pub fn subscribe(&self, prefix: IpNet) -> Result<u32> {
        self.user_defined.subscribe(prefix)
    }

    pub fn unsubscribe(&self, prefix: &IpNet) -> bool {
        self.user_defined.unsubscribe(prefix)
    }

    pub fn user_defined_event(&self, prefix: &IpNet) -> Option<FlapSnapshot> {
        self.user_defined.event(prefix)
    }

    pub fn user_defined_event_count(&self, prefix: &IpNet) -> u64 {
        self.user_defined.event_count(prefix)
    }
}
