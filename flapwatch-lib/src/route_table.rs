use ipnet::IpNet;
use std::collections::HashMap;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::queue::{QueueReceiver, QueueSender};
use crate::update::{AsPath, PathChange, RouteUpdate};

/// Paths currently announced for one prefix, keyed by ADD-PATH identifier.
#[derive(Debug, Default, Clone)]
pub struct RouteEntry {
    paths: HashMap<u32, AsPath>,
}

impl RouteEntry {
    pub fn paths(&self) -> impl Iterator<Item = (&u32, &AsPath)> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Route state of a single update stream.
///
/// Updates of one stream arrive serialized, so the table is owned by exactly
/// one task and needs no locking.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: HashMap<IpNet, RouteEntry>,
    path_count: usize,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable::default()
    }

    /// Applies an update and returns the path change it caused, if any.
    ///
    /// The first announcement of a prefix and a re-announcement of the same
    /// path are not changes; neither is the withdrawal of an unknown path.
    pub fn update(&mut self, update: RouteUpdate) -> Option<PathChange> {
        let RouteUpdate {
            prefix,
            path_id,
            as_path,
            is_withdrawal,
        } = update;

        if is_withdrawal {
            let entry = self.entries.get_mut(&prefix)?;
            let previous_path = entry.paths.remove(&path_id)?;
            self.path_count = self.path_count.saturating_sub(1);
            if entry.paths.is_empty() {
                self.entries.remove(&prefix);
            }
            return Some(PathChange {
                prefix,
                is_withdrawal: true,
                previous_path,
            });
        }

        let entry = self.entries.entry(prefix).or_default();
        match entry.paths.insert(path_id, as_path) {
            None => {
                self.path_count += 1;
                None
            }
            Some(previous_path) => {
                if entry.paths.get(&path_id) == Some(&previous_path) {
                    return None;
                }
                Some(PathChange {
                    prefix,
                    is_withdrawal: false,
                    previous_path,
                })
            }
        }
    }

    pub fn get(&self, prefix: &IpNet) -> Option<&RouteEntry> {
        self.entries.get(prefix)
    }

    /// Number of prefixes with at least one path.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of (prefix, path id) pairs currently imported.
    pub fn path_count(&self) -> usize {
        self.path_count
    }
}

/// Feeds the updates of one stream through a route table and forwards the
/// resulting path changes. Returns when the update queue closes or on shutdown.
///
/// A stream importing more than `import_limit` paths is cut off: the tracker
/// stops, its table is dropped and the update queue closes.
pub async fn track_routes(
    name: String,
    mut rx: QueueReceiver<RouteUpdate>,
    tx: QueueSender<PathChange>,
    import_limit: usize,
    guard: ShutdownGuard,
) -> Result<RouteTable> {
    let mut table = RouteTable::new();
    debug!("{} - route tracker started", name);

    loop {
        let update = tokio::select! {
            _ = guard.cancelled() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        trace!("{} - {:?}", name, update);
        if let Some(change) = table.update(update) {
            tx.send(change).await.map_err(|_| Error::PathChangesClosed)?;
        }

        if table.path_count() > import_limit {
            warn!(
                "{} - import limit of {} paths exceeded, dropping {} prefixes",
                name,
                import_limit,
                table.len()
            );
            return Err(Error::ImportLimitExceeded {
                limit: import_limit,
            });
        }
    }

    debug!(
        "{} - route tracker stopped with {} prefixes",
        name,
        table.len()
    );
    Ok(table)
}
