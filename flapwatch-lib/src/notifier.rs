use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, error, info, warn};

use crate::flap::{FlapNotification, FlapSnapshot};
use crate::queue::{bounded, QueueReceiver, QueueSender, ShedPolicy};

/// Batches a sink may have waiting before new ones are dropped for it.
pub const SINK_QUEUE_CAPACITY: usize = 3;

/// Destination of flap start and end events.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once before dispatching starts. A sink returning `false`
    /// receives no events.
    async fn on_ready(&self) -> bool {
        true
    }

    async fn on_flap_start(&self, event: &FlapSnapshot);

    async fn on_flap_end(&self, event: &FlapSnapshot);
}

/// Fans notification batches out to the registered sinks.
///
/// Every sink runs in its own task so a slow one only loses its own events.
#[derive(Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn Sink>>,
}

impl Notifier {
    pub fn new() -> Notifier {
        Notifier::default()
    }

    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        info!("registered notification sink {}", sink.name());
        self.sinks.push(sink);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Dispatches batches until the notification queue closes or on shutdown,
    /// then lets every sink finish what it already received.
    pub async fn run(self, mut rx: QueueReceiver<Vec<FlapNotification>>, guard: ShutdownGuard) {
        let mut workers: Vec<(QueueSender<Vec<FlapNotification>>, JoinHandle<()>)> = Vec::new();
        for sink in self.sinks {
            if !sink.on_ready().await {
                info!("{} - not ready, skipping", sink.name());
                continue;
            }
            let (tx, rx) = bounded(sink.name(), SINK_QUEUE_CAPACITY, ShedPolicy::Never);
            let handle = tokio::spawn(deliver(sink, rx));
            workers.push((tx, handle));
        }

        loop {
            let batch = tokio::select! {
                _ = guard.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            for (tx, _) in &workers {
                if !tx.offer(batch.clone()) {
                    warn!(
                        "{} - can't keep up, dropped {} notifications",
                        tx.name(),
                        batch.len()
                    );
                }
            }
        }

        for (tx, handle) in workers {
            let name = tx.name();
            drop(tx);
            if let Err(e) = handle.await {
                error!("{} - worker failed: {}", name, e);
            }
        }
        debug!("notifier stopped");
    }
}

async fn deliver(sink: Arc<dyn Sink>, mut rx: QueueReceiver<Vec<FlapNotification>>) {
    while let Some(batch) = rx.recv().await {
        for notification in &batch {
            if notification.is_start {
                sink.on_flap_start(&notification.event).await;
            } else {
                sink.on_flap_end(&notification.event).await;
            }
        }
    }
}
