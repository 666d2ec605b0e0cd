use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ipnet::IpNet;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

use flapwatch_lib::flap::FlapSnapshot;
use flapwatch_lib::notifier::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoricalEventMeta {
    pub prefix: IpNet,
    pub timestamp: i64,
}

impl HistoricalEventMeta {
    /// `<timestamp>_<prefix with '/' replaced by '_'>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            self.timestamp,
            self.prefix.to_string().replace('/', "_")
        )
    }

    pub fn from_file_name(name: &str) -> Option<HistoricalEventMeta> {
        let base = name.strip_suffix(".json")?;
        let (timestamp, prefix) = base.split_once('_')?;
        Some(HistoricalEventMeta {
            prefix: prefix.replace('_', "/").parse().ok()?,
            timestamp: timestamp.parse().ok()?,
        })
    }
}

/// Keeps one JSON file per ended flap.
///
/// Saving stops for good once a rotation fails, so the directory can't grow
/// without bound.
pub struct HistorySink {
    dir: PathBuf,
    max_count: usize,
    retention: Duration,
    failed: AtomicBool,
}

impl HistorySink {
    pub fn new(dir: PathBuf, max_count: usize, retention: Duration) -> HistorySink {
        HistorySink {
            dir,
            max_count,
            retention,
            failed: AtomicBool::new(false),
        }
    }

    pub async fn save(&self, event: &FlapSnapshot, timestamp: i64) -> Result<PathBuf> {
        let meta = HistoricalEventMeta {
            prefix: event.prefix,
            timestamp,
        };
        let path = self.dir.join(meta.file_name());
        let data = serde_json::to_vec(event)?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Removes files past the retention, then the oldest ones beyond the max count.
    pub async fn rotate(&self) -> Result<()> {
        let now = SystemTime::now();
        let mut remaining = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.retention {
                tokio::fs::remove_file(entry.path()).await?;
                continue;
            }
            remaining.push((modified, entry.file_name(), entry.path()));
        }

        if remaining.len() > self.max_count {
            remaining.sort();
            let excess = remaining.len() - self.max_count;
            for (_, _, path) in remaining.into_iter().take(excess) {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    /// Stored events, newest first.
    pub async fn list(&self) -> Result<Vec<HistoricalEventMeta>> {
        let mut list = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(meta) = entry
                .file_name()
                .to_str()
                .and_then(HistoricalEventMeta::from_file_name)
            {
                list.push(meta);
            }
        }
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(list)
    }

    pub async fn get(&self, meta: &HistoricalEventMeta) -> Result<Option<FlapSnapshot>> {
        let path = self.dir.join(meta.file_name());
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Most recent stored event of `prefix`.
    pub async fn latest(
        &self,
        prefix: &IpNet,
    ) -> Result<Option<(HistoricalEventMeta, FlapSnapshot)>> {
        let Some(meta) = self
            .list()
            .await?
            .into_iter()
            .find(|meta| &meta.prefix == prefix)
        else {
            return Ok(None);
        };
        Ok(self.get(&meta).await?.map(|event| (meta, event)))
    }
}

#[async_trait]
impl Sink for HistorySink {
    fn name(&self) -> &'static str {
        "history"
    }

    async fn on_ready(&self) -> bool {
        match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "failed to create history directory {}: {}",
                    self.dir.display(),
                    e
                );
                false
            }
        }
    }

    async fn on_flap_start(&self, _: &FlapSnapshot) {}

    async fn on_flap_end(&self, event: &FlapSnapshot) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }

        match self.save(event, Utc::now().timestamp()).await {
            Ok(path) => debug!("saved {}", path.display()),
            Err(e) => error!("failed to save history for {}: {}", event.prefix, e),
        }

        if let Err(e) = self.rotate().await {
            error!("failed to rotate history, saving stopped: {}", e);
            self.failed.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(prefix: &str) -> FlapSnapshot {
        FlapSnapshot {
            prefix: prefix.parse().unwrap(),
            first_seen: 100,
            total_path_changes: 42,
            rate_sec: Some(0.7),
            rate_sec_history: vec![0.7],
            paths: Vec::new(),
        }
    }

    #[test]
    fn test_file_name() {
        let meta = HistoricalEventMeta {
            prefix: "2001:db8::/32".parse().unwrap(),
            timestamp: 1700000000,
        };

        assert_eq!(meta.file_name(), "1700000000_2001:db8::_32.json");
        assert_eq!(
            HistoricalEventMeta::from_file_name(&meta.file_name()),
            Some(meta)
        );
        assert_eq!(HistoricalEventMeta::from_file_name("notes.txt"), None);
        assert_eq!(HistoricalEventMeta::from_file_name("abc_10.0.0.0_8.json"), None);
    }

    #[tokio::test]
    async fn test_save_list_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let sink = HistorySink::new(dir.path().to_path_buf(), 10, Duration::from_secs(3600));

        sink.save(&event("192.0.2.0/24"), 1000).await.unwrap();
        sink.save(&event("198.51.100.0/24"), 2000).await.unwrap();
        sink.save(&event("192.0.2.0/24"), 3000).await.unwrap();

        let list = sink.list().await.unwrap();
        let timestamps: Vec<_> = list.iter().map(|meta| meta.timestamp).collect();
        assert_eq!(timestamps, vec![3000, 2000, 1000]);

        let stored = sink.get(&list[1]).await.unwrap().unwrap();
        assert_eq!(stored, event("198.51.100.0/24"));

        let missing = HistoricalEventMeta {
            prefix: "203.0.113.0/24".parse().unwrap(),
            timestamp: 1,
        };
        assert_eq!(sink.get(&missing).await.unwrap(), None);

        let (meta, _) = sink
            .latest(&"192.0.2.0/24".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.timestamp, 3000);
    }

    #[tokio::test]
    async fn test_rotate_keeps_max_count() {
        let dir = tempfile::tempdir().unwrap();
        let sink = HistorySink::new(dir.path().to_path_buf(), 2, Duration::from_secs(3600));

        for timestamp in [1000, 2000, 3000] {
            sink.save(&event("192.0.2.0/24"), timestamp).await.unwrap();
        }
        sink.rotate().await.unwrap();

        let timestamps: Vec<_> = sink
            .list()
            .await
            .unwrap()
            .iter()
            .map(|meta| meta.timestamp)
            .collect();
        assert_eq!(timestamps, vec![3000, 2000]);
    }

    #[tokio::test]
    async fn test_rotate_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let sink = HistorySink::new(dir.path().to_path_buf(), 10, Duration::ZERO);

        sink.save(&event("192.0.2.0/24"), 1000).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.rotate().await.unwrap();

        assert!(sink.list().await.unwrap().is_empty());
    }
}
