use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::update::AsPath;

/// Evictions an entry may survive at the least recently used position
/// before it is removed without looking for a cheaper candidate.
const AGE_LIMIT: u32 = 10_000;

/// Number of least recently used entries inspected per eviction.
const SCAN_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    pub path: AsPath,
    pub announcement_count: u64,
    pub withdrawal_count: u64,
}

impl PathInfo {
    fn new(path: AsPath, is_withdrawal: bool) -> PathInfo {
        PathInfo {
            path,
            announcement_count: u64::from(!is_withdrawal),
            withdrawal_count: u64::from(is_withdrawal),
        }
    }

    fn increment(&mut self, is_withdrawal: bool) {
        let counter = if is_withdrawal {
            &mut self.withdrawal_count
        } else {
            &mut self.announcement_count
        };
        *counter = counter.saturating_add(1);
    }

    /// Number of times this path was seen, in either direction.
    pub fn total(&self) -> u64 {
        self.announcement_count.saturating_add(self.withdrawal_count)
    }
}

#[derive(Debug)]
struct Slot {
    info: PathInfo,
    age: u32,
}

#[derive(Debug, Default)]
struct Paths {
    // path -> position in `order`
    index: HashMap<AsPath, u64>,
    // least recently used first
    order: BTreeMap<u64, Slot>,
    next: u64,
}

impl Paths {
    fn evict_least_valuable(&mut self) {
        let (oldest, age) = match self.order.first_entry() {
            Some(mut entry) => {
                let key = *entry.key();
                let slot = entry.get_mut();
                slot.age = slot.age.saturating_add(1);
                (key, slot.age)
            }
            None => return,
        };

        let mut victim = oldest;
        if age < AGE_LIMIT {
            let mut min_count = u64::MAX;
            for (position, slot) in self.order.iter().take(SCAN_WINDOW) {
                let count = slot.info.total();
                if count < min_count {
                    min_count = count;
                    victim = *position;
                    if count == 1 {
                        break;
                    }
                }
            }
        }

        if let Some(slot) = self.order.remove(&victim) {
            self.index.remove(&slot.info.path);
        }
    }
}

/// Bounded record of the distinct AS paths seen for one prefix.
///
/// Eviction mixes recency and frequency: among the least recently used
/// entries, the one seen the fewest times goes first, and an entry that keeps
/// surviving at the head of the order is eventually evicted regardless.
#[derive(Debug)]
pub struct PathHistory {
    paths: Mutex<Paths>,
    limit: usize,
    enabled: bool,
}

impl PathHistory {
    pub fn new(limit: usize) -> PathHistory {
        PathHistory::with_recording(limit, true)
    }

    pub fn with_recording(limit: usize, enabled: bool) -> PathHistory {
        PathHistory {
            paths: Mutex::new(Paths::default()),
            limit,
            enabled,
        }
    }

    pub fn record(&self, path: &[u32], is_withdrawal: bool) {
        if !self.enabled || self.limit == 0 {
            return;
        }

        let mut paths = self.paths.lock();
        let Paths { index, order, next } = &mut *paths;

        if let Some(position) = index.get_mut(path) {
            if let Some(mut slot) = order.remove(&*position) {
                slot.info.increment(is_withdrawal);
                slot.age = 0;
                *next += 1;
                *position = *next;
                order.insert(*next, slot);
            }
            return;
        }

        if index.len() >= self.limit {
            paths.evict_least_valuable();
        }

        paths.next += 1;
        let position = paths.next;
        paths.index.insert(path.to_vec(), position);
        paths.order.insert(
            position,
            Slot {
                info: PathInfo::new(path.to_vec(), is_withdrawal),
                age: 0,
            },
        );
    }

    /// Point-in-time copy of the recorded paths, least recently used first.
    pub fn all(&self) -> Vec<PathInfo> {
        self.paths
            .lock()
            .order
            .values()
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.paths.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_saturate() {
        let mut info = PathInfo {
            path: vec![65000, 65001],
            announcement_count: u64::MAX,
            withdrawal_count: u64::MAX,
        };

        info.increment(false);
        info.increment(true);

        assert_eq!(info.announcement_count, u64::MAX);
        assert_eq!(info.withdrawal_count, u64::MAX);
        assert_eq!(info.total(), u64::MAX);
    }

    #[test]
    fn test_recorded_counters_saturate() {
        let history = PathHistory::new(4);
        history.record(&[65000, 65001], false);
        for slot in history.paths.lock().order.values_mut() {
            slot.info.announcement_count = u64::MAX;
        }

        history.record(&[65000, 65001], false);

        let all = history.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].announcement_count, u64::MAX);
        assert_eq!(all[0].withdrawal_count, 0);
    }

    #[test]
    fn test_eviction_ages_the_head() {
        let history = PathHistory::new(1);
        history.record(&[65001], false);
        history.record(&[65001], false);

        history.record(&[65002], false);

        let survivor: AsPath = vec![65002];
        let paths = history.paths.lock();
        assert_eq!(paths.index.len(), 1);
        assert_eq!(paths.order.len(), 1);
        assert!(paths.index.contains_key(&survivor));
    }
}
