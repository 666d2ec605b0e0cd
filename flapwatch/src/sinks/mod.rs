pub mod history;
pub mod log;
pub mod script;
pub mod webhook;

use anyhow::Result;
use std::sync::Arc;

use flapwatch_lib::notifier::Notifier;

use crate::config::NotifyConfig;
use history::HistorySink;
use log::LogSink;
use script::ScriptSink;
use webhook::WebhookSink;

/// Registers every sink the configuration asks for. The history sink is
/// returned as well since the API reads from it.
pub fn build_notifier(cfg: &NotifyConfig) -> Result<(Notifier, Option<Arc<HistorySink>>)> {
    let mut notifier = Notifier::new();

    if cfg.log {
        notifier.register(Arc::new(LogSink));
    }

    if !cfg.webhook_start.is_empty() || !cfg.webhook_end.is_empty() {
        notifier.register(Arc::new(WebhookSink::new(cfg)?));
    }

    if cfg.script_start.is_some() || cfg.script_end.is_some() {
        notifier.register(Arc::new(ScriptSink::new(
            cfg.script_start.clone(),
            cfg.script_end.clone(),
        )));
    }

    let history = if cfg.history_enable {
        let history = Arc::new(HistorySink::new(
            cfg.history_dir.clone(),
            cfg.history_max_count,
            cfg.history_retention,
        ));
        notifier.register(history.clone());
        Some(history)
    } else {
        None
    };

    Ok((notifier, history))
}
