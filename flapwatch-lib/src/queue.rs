//! Bounded queues between pipeline stages.
//!
//! Producers either wait for capacity (`send`) or give up immediately
//! (`offer`). Consumers shed load when the backlog grows past a high-water
//! mark instead of letting a slow stage stall the protocol readers.

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedPolicy {
    Never,
    /// Drop queued items in chunks of `burst` while more than `high_water` are pending.
    Above { high_water: usize, burst: usize },
}

#[derive(Debug, Default)]
pub struct QueueStats {
    rejected: AtomicU64,
    shed: AtomicU64,
}

impl QueueStats {
    /// Items refused by `offer` because the queue was full or closed.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Items discarded by the receiver while shedding.
    pub fn shed(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }
}

pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    policy: ShedPolicy,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    (
        QueueSender {
            name,
            tx,
            stats: stats.clone(),
        },
        QueueReceiver {
            name,
            rx,
            policy,
            stats,
        },
    )
}

#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    stats: Arc<QueueStats>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueues without waiting. Returns `false` if the item was dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("flapwatch_queue_rejected_total", "queue" => self.name).increment(1);
                false
            }
        }
    }

    /// Enqueues, waiting for capacity.
    pub async fn send(&self, item: T) -> Result<(), SendError<T>> {
        self.tx.send(item).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    policy: ShedPolicy,
    stats: Arc<QueueStats>,
}

impl<T> QueueReceiver<T> {
    /// Next item, or `None` once every sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<T> {
        self.shed();
        self.rx.recv().await
    }

    /// Number of items waiting in the queue.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    fn shed(&mut self) -> u64 {
        let ShedPolicy::Above { high_water, burst } = self.policy else {
            return 0;
        };
        if self.rx.len() <= high_water {
            return 0;
        }

        warn!("{} - can't keep up, dropping queued items", self.name);
        let mut dropped = 0;
        'drain: while self.rx.len() > high_water {
            for _ in 0..burst.max(1) {
                if self.rx.try_recv().is_err() {
                    break 'drain;
                }
                dropped += 1;
            }
        }

        self.stats.shed.fetch_add(dropped, Ordering::Relaxed);
        counter!("flapwatch_queue_shed_total", "queue" => self.name).increment(dropped);
        info!("{} - recovered after dropping {} items", self.name, dropped);
        dropped
    }
}
