use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    config::AppConfig,
    error::ProbeError,
    orchestrator::Orchestrator,
    report::ResultBoard,
    targets::parse_targets,
    types::{port_from_raw, ProbeEvent, ProbeParameters, Target},
};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    board: Arc<RwLock<ResultBoard>>, // fed by the event pump
    defaults: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        board: Arc<RwLock<ResultBoard>>,
        defaults: AppConfig,
    ) -> Self {
        Self {
            orchestrator,
            board,
            defaults: Arc::new(defaults),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn board(&self) -> &Arc<RwLock<ResultBoard>> {
        &self.board
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusView {
    pub state: String, // "idle" | "running"
    pub batch_id: Option<u64>,
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub registered: usize,
}

impl StatusView {
    fn of(orch: &Orchestrator) -> Self {
        let registered = orch.registered();
        match orch.status() {
            Some(s) => Self {
                state: "running".into(),
                batch_id: Some(s.batch_id),
                total: s.total,
                pending: s.pending,
                completed: s.completed,
                registered,
            },
            None => Self {
                state: "idle".into(),
                batch_id: None,
                total: 0,
                pending: 0,
                completed: 0,
                registered,
            },
        }
    }
}

/// Either a raw target string (same syntax as the CLI) or an explicit list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TargetsInput {
    Raw(String),
    List(Vec<String>),
}

impl TargetsInput {
    fn into_targets(self) -> Result<Vec<Target>, ProbeError> {
        match self {
            TargetsInput::Raw(raw) => parse_targets(&raw),
            TargetsInput::List(items) => {
                let mut out = Vec::new();
                for item in &items {
                    out.extend(parse_targets(item)?);
                }
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub targets: TargetsInput,
    #[serde(default)]
    pub ping_count: Option<u32>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub no_port: bool,
    #[serde(default)]
    pub port_timeout_ms: Option<u64>,
}

impl BatchRequest {
    fn parameters(&self, defaults: &AppConfig) -> Result<ProbeParameters, ProbeError> {
        let port = if self.no_port {
            None
        } else {
            self.port.or(defaults.port).map(port_from_raw).transpose()?
        };
        Ok(ProbeParameters::new(
            self.ping_count.unwrap_or(defaults.ping_count),
            port,
            Duration::from_millis(self.port_timeout_ms.unwrap_or(defaults.port_timeout_ms)),
        ))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/batch", post(post_batch))
        .route("/stop", post(post_stop))
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Drain orchestrator events into the shared board until the sender is dropped.
pub fn spawn_event_pump(
    mut rx: mpsc::UnboundedReceiver<ProbeEvent>,
    board: Arc<RwLock<ResultBoard>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            board.write().await.apply(event);
        }
        debug!("event channel closed");
    })
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn spawn_server<F>(bind: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(bind = %bind, "serving control API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(StatusView::of(&app.orchestrator)))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let board = app.board.read().await.clone();
    (StatusCode::OK, Json(board))
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    let report = app.orchestrator.stop_all().await;
    debug!(stopped = report.stopped, forced = report.forced, "stop requested over http");
    (StatusCode::OK, Json(StatusView::of(&app.orchestrator)))
}

async fn post_batch(
    State(app): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> impl IntoResponse {
    let params = match req.parameters(&app.defaults) {
        Ok(p) => p,
        Err(e) => return bad_request(e),
    };
    let targets = match req.targets.into_targets() {
        Ok(t) => t,
        Err(e) => return bad_request(e),
    };
    match app.orchestrator.start_batch(targets, params).await {
        Ok(started) => (StatusCode::ACCEPTED, Json(started)).into_response(),
        Err(e) => bad_request(e),
    }
}

fn bad_request(e: ProbeError) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
        .into_response()
}
