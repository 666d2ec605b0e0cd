mod api;
mod bmp;
mod config;
mod session;
mod sinks;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{debug, error, info};

use flapwatch_lib::queue::QueueSender;
use flapwatch_lib::spawn_pipeline;
use flapwatch_lib::update::PathChange;

use crate::config::{app_config, AppConfig};
use crate::session::Sessions;
use crate::sinks::build_notifier;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    config: String,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn set_tracing(cli: &Cli) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_max_level(cli.verbose)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn set_prometheus() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    // Pipeline metrics
    metrics::describe_counter!(
        "flapwatch_path_changes_total",
        "Total number of path changes seen by the detector"
    );
    metrics::describe_counter!(
        "flapwatch_notifications_total",
        "Total number of flap start and end notifications"
    );
    metrics::describe_counter!(
        "flapwatch_notification_batches_dropped_total",
        "Notification batches dropped because the notification queue was full"
    );
    metrics::describe_counter!(
        "flapwatch_queue_shed_total",
        "Queued items dropped while shedding load"
    );
    metrics::describe_counter!(
        "flapwatch_queue_rejected_total",
        "Items refused by a full queue"
    );
    metrics::describe_gauge!("flapwatch_tracked_prefixes", "Prefixes tracked by the detector");
    metrics::describe_gauge!("flapwatch_active_flaps", "Prefixes currently flapping");
    metrics::describe_gauge!(
        "flapwatch_user_defined_prefixes",
        "Prefixes monitored on request"
    );

    // Ingress metrics
    metrics::describe_counter!(
        "flapwatch_bmp_messages_total",
        "Total number of BMP messages received"
    );
    metrics::describe_gauge!("flapwatch_bmp_sessions", "Connected BMP sessions");

    // Sink metrics
    metrics::describe_counter!(
        "flapwatch_webhook_requests_total",
        "Webhook calls by outcome"
    );

    Ok(handle)
}

async fn bmp_handler(
    cfg: Arc<AppConfig>,
    sessions: Sessions,
    path_changes: QueueSender<PathChange>,
    guard: ShutdownGuard,
) -> Result<()> {
    let bmp_config = cfg.bmp.clone();

    debug!("binding bmp listener to {}", bmp_config.host);
    let bmp_listener = TcpListener::bind(&bmp_config.host)
        .await
        .with_context(|| format!("failed to bind BMP listener to {}", bmp_config.host))?;

    loop {
        let (mut bmp_stream, _) = tokio::select! {
            _ = guard.cancelled() => return Ok(()),
            accepted = bmp_listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept BMP connection: {}", e);
                    continue;
                }
            },
        };

        let bmp_config = bmp_config.clone();
        let sessions = sessions.clone();
        let path_changes = path_changes.clone();
        let task_guard = guard.clone();

        // Spawn a new task for the BMP connection with each router
        guard.spawn_task(async move {
            if let Err(e) = bmp::handle(
                &mut bmp_stream,
                bmp_config,
                sessions,
                path_changes,
                task_guard,
            )
            .await
            {
                error!("BMP session ended: {}", e);
            }
        });
    }
}

async fn api_handler(
    cfg: Arc<AppConfig>,
    router: axum::Router,
    guard: ShutdownGuard,
) -> Result<()> {
    let api_config = cfg.api.clone();

    debug!("binding api listener to {}", api_config.host);
    let listener = TcpListener::bind(&api_config.host)
        .await
        .with_context(|| format!("failed to bind API listener to {}", api_config.host))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { guard.cancelled().await })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    set_tracing(&cli)?;

    let cfg = match app_config(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };
    let prometheus = set_prometheus()?;

    let shutdown: Shutdown = Shutdown::default();
    let sessions = Sessions::new();

    let (notifier, history) = build_notifier(&cfg.notify)?;
    let sinks = notifier.names();
    info!("notification sinks: {:?}", sinks);

    let pipeline = match spawn_pipeline(cfg.detector.clone(), notifier, shutdown.guard()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let router = api::app(
        pipeline.state.clone(),
        sessions.clone(),
        history,
        sinks,
        prometheus,
    );

    let bmp_task = shutdown.spawn_task_fn({
        let cfg = cfg.clone();
        let sessions = sessions.clone();
        let path_changes = pipeline.path_changes.clone();
        move |guard| bmp_handler(cfg, sessions, path_changes, guard)
    });
    let api_task = shutdown.spawn_task_fn({
        let cfg = cfg.clone();
        move |guard| api_handler(cfg, router, guard)
    });

    tokio::select! {
        _ = shutdown.shutdown_with_limit(Duration::from_secs(1)) => {}
        result = bmp_task => log_exit("bmp", result),
        result = api_task => log_exit("api", result),
    }

    Ok(())
}

fn log_exit(name: &str, result: Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("{} task stopped", name),
        Ok(Err(e)) => error!("{} task failed: {:#}", name, e),
        Err(e) => error!("{} task panicked: {}", name, e),
    }
}
