use async_trait::async_trait;
use tracing::info;

use flapwatch_lib::flap::FlapSnapshot;
use flapwatch_lib::notifier::Sink;

pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn on_flap_start(&self, event: &FlapSnapshot) {
        info!(
            "flap start: prefix={} first_seen={} total_path_changes={}",
            event.prefix, event.first_seen, event.total_path_changes
        );
    }

    async fn on_flap_end(&self, event: &FlapSnapshot) {
        info!(
            "flap end: prefix={} first_seen={} total_path_changes={}",
            event.prefix, event.first_seen, event.total_path_changes
        );
    }
}
