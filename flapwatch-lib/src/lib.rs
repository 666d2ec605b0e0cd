pub mod config;
pub mod detector;
pub mod error;
pub mod flap;
pub mod notifier;
pub mod path_history;
pub mod queue;
pub mod route_table;
pub mod state;
pub mod statistics;
pub mod update;
pub mod user_defined;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, error};

use crate::config::DetectorConfig;
use crate::detector::{detect_flaps, Detector};
use crate::error::Result;
use crate::notifier::Notifier;
use crate::queue::{bounded, QueueSender, ShedPolicy};
use crate::state::FlapState;
use crate::statistics::sample_statistics;
use crate::update::PathChange;
use crate::user_defined::monitor_user_defined;

pub const PATH_CHANGE_QUEUE_CAPACITY: usize = 10_000;
pub const PATH_CHANGE_QUEUE_HIGH_WATER: usize = 9_700;
pub const PATH_CHANGE_SHED_BURST: usize = 50;
pub const USER_DEFINED_QUEUE_CAPACITY: usize = 1_000;
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 5;

/// Handle on a running detection pipeline.
pub struct Pipeline {
    pub state: FlapState,
    pub path_changes: QueueSender<PathChange>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    sampler: JoinHandle<()>,
}

impl Pipeline {
    /// Closes the pipeline input and waits until every stage has drained.
    pub async fn join(self) {
        let Pipeline {
            path_changes,
            tasks,
            sampler,
            ..
        } = self;
        drop(path_changes);

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!("{} task failed: {}", name, e);
            }
        }
        sampler.abort();
        debug!("pipeline stopped");
    }
}

/// Validates `config` and starts every stage of the detection pipeline.
///
/// Route trackers feed the returned [`Pipeline::path_changes`] sender. The
/// pipeline stops when the shutdown guard is cancelled or once every clone of
/// that sender is dropped.
pub fn spawn_pipeline(
    config: DetectorConfig,
    notifier: Notifier,
    guard: ShutdownGuard,
) -> Result<Pipeline> {
    let config = config.normalize()?;
    let state = FlapState::new(config);

    let (path_tx, path_rx) = bounded(
        "path_changes",
        PATH_CHANGE_QUEUE_CAPACITY,
        ShedPolicy::Above {
            high_water: PATH_CHANGE_QUEUE_HIGH_WATER,
            burst: PATH_CHANGE_SHED_BURST,
        },
    );
    let (user_tx, user_rx) = bounded(
        "user_defined",
        USER_DEFINED_QUEUE_CAPACITY,
        ShedPolicy::Never,
    );
    let (notify_tx, notify_rx) = bounded(
        "notifications",
        NOTIFICATION_QUEUE_CAPACITY,
        ShedPolicy::Never,
    );

    let detector = Detector::new(state.clone(), Utc::now().timestamp());
    let tasks = vec![
        (
            "detector",
            guard.spawn_task(detect_flaps(
                detector,
                path_rx,
                user_tx,
                notify_tx,
                guard.clone(),
            )),
        ),
        (
            "user_defined",
            guard.spawn_task(monitor_user_defined(
                state.user_defined().clone(),
                user_rx,
                guard.clone(),
            )),
        ),
        (
            "notifier",
            guard.spawn_task(notifier.run(notify_rx, guard.clone())),
        ),
    ];
    let sampler = guard.spawn_task(sample_statistics(state.clone(), guard.clone()));

    Ok(Pipeline {
        state,
        path_changes: path_tx,
        tasks,
        sampler,
    })
}
