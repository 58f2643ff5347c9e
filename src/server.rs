use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    engine::{self, EngineConfig},
    feeder::RangeFeeder,
    fetchers::FetcherRegistry,
    lifecycle::{ScanState, StateSignal},
    ports,
    registry::ScanRegistry,
    types::{FetcherSpec, ResultRow},
};

/// Shared state of the read API. The registry is the one the producers
/// write into; every endpoint reads it live, mid-scan included.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<ScanRegistry>,
    signal: StateSignal,
    fetchers: Arc<FetcherRegistry>,
    active: Arc<RwLock<ActiveScan>>,
}

#[derive(Default)]
struct ActiveScan {
    cancel: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl AppState {
    pub fn new(registry: Arc<ScanRegistry>, signal: StateSignal, fetchers: Arc<FetcherRegistry>) -> Self {
        Self {
            registry,
            signal,
            fetchers,
            active: Arc::new(RwLock::new(ActiveScan::default())),
        }
    }
}

/// Summary view served by `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: String,
    pub feeder: String,
    pub scanned: u64,
    pub alive: u64,
    pub with_ports: u64,
    pub elapsed_ms: u64,
    pub started_at: String,
    pub finished: bool,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    /// CIDRs and/or plain IPs, comma separated. Omit to autodetect the
    /// local networks.
    pub targets: Option<String>,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub fetchers: Option<Vec<String>>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub include_unresponsive: bool,
}

#[derive(Debug, Deserialize)]
struct FindParams {
    text: String,
    #[serde(default)]
    start: usize,
}

#[derive(Debug, Deserialize)]
struct SortRequest {
    column: usize,
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    positions: Vec<usize>,
}

#[derive(Serialize)]
struct RowsResponse {
    fetchers: Vec<FetcherSpec>,
    rows: Vec<PositionedRow>,
}

#[derive(Serialize)]
struct PositionedRow {
    position: usize,
    #[serde(flatten)]
    row: ResultRow,
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .route("/results/{position}", get(get_row_text))
        .route("/find", get(get_find))
        .route("/sort", post(post_sort))
        .route("/remove", post(post_remove))
        .route("/scan", post(post_scan))
        .route("/stop", post(post_stop))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http());

    info!("serving scan API on http://{bind}");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

fn status_snapshot(state: &AppState) -> Status {
    let summary = state.registry.summary();
    Status {
        state: state.signal.current().as_str().to_string(),
        feeder: state.registry.feeder_info(),
        scanned: summary.scanned,
        alive: summary.alive,
        with_ports: summary.with_ports,
        elapsed_ms: summary.elapsed().as_millis() as u64,
        started_at: summary
            .started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z")),
        finished: summary.finished,
    }
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(status_snapshot(&state)))
}

async fn get_results(State(state): State<AppState>) -> impl IntoResponse {
    let fetchers = state.registry.selected_fetchers().to_vec();
    let rows = state
        .registry
        .snapshot()
        .into_iter()
        .enumerate()
        .map(|(position, result)| PositionedRow {
            position,
            row: result.row(),
        })
        .collect();
    (StatusCode::OK, Json(RowsResponse { fetchers, rows }))
}

async fn get_row_text(
    State(state): State<AppState>,
    Path(position): Path<usize>,
) -> impl IntoResponse {
    match state.registry.render_row(position) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
    }
}

async fn get_find(
    State(state): State<AppState>,
    Query(params): Query<FindParams>,
) -> impl IntoResponse {
    let position = state.registry.find_text(&params.text, params.start);
    (StatusCode::OK, Json(serde_json::json!({ "position": position })))
}

async fn post_sort(
    State(state): State<AppState>,
    Json(req): Json<SortRequest>,
) -> impl IntoResponse {
    match state.registry.sort_by_column(req.column) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn post_remove(
    State(state): State<AppState>,
    Json(req): Json<RemoveRequest>,
) -> impl IntoResponse {
    match state.registry.remove(&req.positions) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn post_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let feeder = match &req.targets {
        Some(spec) => match RangeFeeder::parse(spec) {
            Ok(f) => f,
            Err(err) => return (StatusCode::BAD_REQUEST, format!("invalid targets: {err}")).into_response(),
        },
        None => match RangeFeeder::detect_local() {
            Ok(f) => f,
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to detect local networks: {err}"),
                )
                    .into_response()
            }
        },
    };

    let sweep_ports = match &req.ports {
        Some(spec) => match ports::parse_port_spec(spec) {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => return (StatusCode::BAD_REQUEST, "empty port list".to_string()).into_response(),
            Err(err) => return (StatusCode::BAD_REQUEST, format!("invalid ports: {err}")).into_response(),
        },
        None => ports::default_ports(),
    };

    let selection = match &req.fetchers {
        Some(ids) => match state.fetchers.select(ids) {
            Ok(s) => s,
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        },
        None => state.fetchers.default_selection(),
    };

    let config = EngineConfig {
        concurrency: req.concurrency.unwrap_or(256),
        timeout: Duration::from_millis(req.timeout_ms.unwrap_or(400)),
        include_unresponsive: req.include_unresponsive,
        ports: sweep_ports,
    };

    let cancel = CancellationToken::new();
    {
        let mut active = state.active.write().await;
        // at most one scan at a time; a new request aborts the old run and
        // waits for its producers to quiesce before the registry is reset
        if let Some(previous) = active.cancel.take() {
            previous.cancel();
        }
        if let Some(previous) = active.task.take() {
            let _ = previous.await;
        }
        let task_state = state.clone();
        let task_cancel = cancel.clone();
        active.cancel = Some(cancel);
        active.task = Some(tokio::spawn(async move {
            let outcome = engine::run_scan(
                task_state.registry.clone(),
                &feeder,
                selection,
                config,
                task_cancel,
                task_state.signal.clone(),
            )
            .await;
            if let Err(err) = outcome {
                warn!(%err, "scan run failed");
            }
        }));
    }

    StatusCode::ACCEPTED.into_response()
}

async fn post_stop(State(state): State<AppState>) -> impl IntoResponse {
    let mut active = state.active.write().await;
    match active.cancel.take() {
        Some(cancel) => {
            cancel.cancel();
            if state.signal.current() == ScanState::Scanning {
                state.signal.transition(ScanState::Stopping);
            }
            StatusCode::ACCEPTED
        }
        None => StatusCode::NO_CONTENT,
    }
}
