use axum::{
    extract::{Query, State as AxumState},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use ipnet::IpNet;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use flapwatch_lib::config::DetectorConfig;
use flapwatch_lib::error::Error;
use flapwatch_lib::flap::{FlapSnapshot, FlapSummary};
use flapwatch_lib::state::{ActiveFlaps, FlapState};
use flapwatch_lib::statistics::Metric;

use crate::session::{SessionInfo, Sessions};
use crate::sinks::history::{HistoricalEventMeta, HistorySink};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
struct AppState {
    state: FlapState,
    sessions: Sessions,
    history: Option<Arc<HistorySink>>,
    sinks: Vec<&'static str>,
    prometheus: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct Capabilities {
    version: &'static str,
    sinks: Vec<&'static str>,
    parameters: DetectorConfig,
    history: bool,
}

#[derive(Debug, Deserialize)]
struct PrefixQuery {
    prefix: IpNet,
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    prefix: IpNet,
    timestamp: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoricalEvent {
    meta: HistoricalEventMeta,
    event: FlapSnapshot,
}

pub fn app(
    state: FlapState,
    sessions: Sessions,
    history: Option<Arc<HistorySink>>,
    sinks: Vec<&'static str>,
    prometheus: PrometheusHandle,
) -> Router {
    let app_state = AppState {
        state,
        sessions,
        history,
        sinks,
        prometheus,
    };

    Router::new()
        .route("/capabilities", get(capabilities))
        .route("/flaps/active", get(active))
        .route("/flaps/active/full", get(active_full))
        .route("/flaps/prefix", get(prefix))
        .route("/flaps/metrics", get(flap_metrics))
        .route("/flaps/avgRouteChanges90", get(average_route_changes_90))
        .route("/flaps/history", get(self::history))
        .route("/flaps/historical", get(historical))
        .route("/userDefined/subscribe", post(subscribe))
        .route("/userDefined/unsubscribe", post(unsubscribe))
        .route("/userDefined/prefix", get(user_defined))
        .route("/sessions", get(self::sessions))
        .route("/metrics", get(metrics))
        .with_state(app_state)
}

async fn capabilities(AxumState(app): AxumState<AppState>) -> Json<Capabilities> {
    Json(Capabilities {
        version: env!("CARGO_PKG_VERSION"),
        sinks: app.sinks.clone(),
        parameters: app.state.config().clone(),
        history: app.history.is_some(),
    })
}

async fn active(AxumState(app): AxumState<AppState>) -> Json<Vec<FlapSummary>> {
    Json(app.state.statistics().active_summaries())
}

async fn active_full(AxumState(app): AxumState<AppState>) -> Json<ActiveFlaps> {
    Json(app.state.active_flaps())
}

async fn prefix(
    AxumState(app): AxumState<AppState>,
    Query(query): Query<PrefixQuery>,
) -> Json<Option<FlapSnapshot>> {
    Json(app.state.flap(&query.prefix))
}

async fn flap_metrics(AxumState(app): AxumState<AppState>) -> Json<Metric> {
    Json(app.state.statistics().metric(app.sessions.len()))
}

async fn average_route_changes_90(AxumState(app): AxumState<AppState>) -> String {
    format!("{:.2}", app.state.statistics().average_route_changes_90())
}

fn history_sink(app: &AppState) -> Result<&HistorySink, (StatusCode, String)> {
    app.history.as_deref().ok_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        "history is not enabled".to_string(),
    ))
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    error!("history lookup failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "history lookup failed".to_string(),
    )
}

async fn history(AxumState(app): AxumState<AppState>) -> ApiResult<Vec<HistoricalEventMeta>> {
    let sink = history_sink(&app)?;
    sink.list().await.map(Json).map_err(internal_error)
}

async fn historical(
    AxumState(app): AxumState<AppState>,
    Query(query): Query<HistoricalQuery>,
) -> ApiResult<Option<HistoricalEvent>> {
    let sink = history_sink(&app)?;

    let found = match query.timestamp {
        Some(timestamp) => {
            let meta = HistoricalEventMeta {
                prefix: query.prefix,
                timestamp,
            };
            sink.get(&meta)
                .await
                .map_err(internal_error)?
                .map(|event| HistoricalEvent { meta, event })
        }
        None => sink
            .latest(&query.prefix)
            .await
            .map_err(internal_error)?
            .map(|(meta, event)| HistoricalEvent { meta, event }),
    };
    Ok(Json(found))
}

async fn subscribe(
    AxumState(app): AxumState<AppState>,
    Query(query): Query<PrefixQuery>,
) -> ApiResult<u32> {
    match app.state.subscribe(query.prefix) {
        Ok(subscribers) => Ok(Json(subscribers)),
        Err(e @ Error::CapacityExceeded { .. }) => {
            Err((StatusCode::TOO_MANY_REQUESTS, e.to_string()))
        }
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

async fn unsubscribe(
    AxumState(app): AxumState<AppState>,
    Query(query): Query<PrefixQuery>,
) -> StatusCode {
    if app.state.unsubscribe(&query.prefix) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn user_defined(
    AxumState(app): AxumState<AppState>,
    Query(query): Query<PrefixQuery>,
) -> Json<Option<FlapSnapshot>> {
    Json(app.state.user_defined_event(&query.prefix))
}

async fn sessions(AxumState(app): AxumState<AppState>) -> Json<Vec<SessionInfo>> {
    Json(app.sessions.list())
}

async fn metrics(AxumState(app): AxumState<AppState>) -> String {
    app.prometheus.render()
}
