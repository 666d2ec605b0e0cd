use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};

use flapwatch_lib::flap::FlapSnapshot;
use flapwatch_lib::notifier::Sink;

/// Runs an executable per event with the event JSON, without path history,
/// as its only argument.
pub struct ScriptSink {
    start: Option<PathBuf>,
    end: Option<PathBuf>,
}

impl ScriptSink {
    pub fn new(start: Option<PathBuf>, end: Option<PathBuf>) -> ScriptSink {
        ScriptSink { start, end }
    }

    async fn run(&self, path: &Path, event: &FlapSnapshot) {
        let argument = match serde_json::to_string(&event.without_paths()) {
            Ok(argument) => argument,
            Err(e) => {
                error!("failed to serialize flap for {}: {}", event.prefix, e);
                return;
            }
        };

        match Command::new(path).arg(argument).status().await {
            Ok(status) if status.success() => {
                debug!("{} ran for {}", path.display(), event.prefix);
            }
            Ok(status) => {
                error!(
                    "{} exited with {} for {}",
                    path.display(),
                    status,
                    event.prefix
                );
            }
            Err(e) => {
                error!("failed to run {}: {}", path.display(), e);
            }
        }
    }
}

#[async_trait]
impl Sink for ScriptSink {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn on_ready(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    async fn on_flap_start(&self, event: &FlapSnapshot) {
        if let Some(path) = &self.start {
            self.run(path, event).await;
        }
    }

    async fn on_flap_end(&self, event: &FlapSnapshot) {
        if let Some(path) = &self.end {
            self.run(path, event).await;
        }
    }
}
