//! Axum JSON surface for reconciliation sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bpre_adapters::HttpRosterSource;
use bpre_core::{BatchIntent, BatchReport, ProgressState};
use bpre_reconcile::{
    ProgressTracker, ReconcileConfig, ReconcileError, ReconcileSession, Reconciler, SessionState,
    SessionView,
};
use bpre_storage::ApiClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bpre-web";

const UPLOAD_LIMIT_BYTES: usize = 16 * 1024 * 1024;

struct SessionEntry {
    session: ReconcileSession,
    progress: Option<Arc<ProgressTracker>>,
    updated: Instant,
}

/// How many settled sessions the server keeps, and for how long.
#[derive(Debug, Clone, Copy)]
pub struct SessionRetention {
    pub max_sessions: usize,
    pub ttl: Duration,
}

impl Default for SessionRetention {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

pub struct AppState {
    reconciler: Arc<Reconciler>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    retention: SessionRetention,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self::with_retention(reconciler, SessionRetention::default())
    }

    pub fn with_retention(reconciler: Reconciler, retention: SessionRetention) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            sessions: Mutex::new(HashMap::new()),
            retention,
        }
    }
}

/// Drop sessions idle past the TTL, then the least recently touched ones
/// above the cap. Executing sessions are never dropped.
fn prune(sessions: &mut HashMap<Uuid, SessionEntry>, retention: SessionRetention) {
    let before = sessions.len();
    sessions.retain(|_, entry| {
        entry.session.state() == SessionState::Executing || entry.updated.elapsed() <= retention.ttl
    });

    let excess = sessions.len().saturating_sub(retention.max_sessions);
    if excess > 0 {
        let mut settled: Vec<(Instant, Uuid)> = sessions
            .iter()
            .filter(|(_, entry)| entry.session.state() != SessionState::Executing)
            .map(|(id, entry)| (entry.updated, *id))
            .collect();
        settled.sort();
        for (_, id) in settled.into_iter().take(excess) {
            sessions.remove(&id);
        }
    }

    let dropped = before - sessions.len();
    if dropped > 0 {
        debug!(dropped, kept = sessions.len(), "pruned sessions");
    }
}

/// Settle a session whose batch task has ended, one way or the other.
fn close_session(session: &mut ReconcileSession, outcome: Result<BatchReport, JoinError>) {
    let closed = match outcome {
        Ok(report) => session.finish_execution(report).map(|_| ()),
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "batch task aborted");
            session.abort_execution(&format!("batch task aborted: {err}"))
        }
    };
    if let Err(err) = closed {
        warn!(session_id = %session.id(), error = %err, "could not close session");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionPayload {
    #[serde(flatten)]
    pub session: SessionView,
    pub progress: Option<ProgressState>,
}

impl SessionEntry {
    fn payload(&self) -> SessionPayload {
        SessionPayload {
            session: self.session.view(),
            progress: self.progress.as_ref().map(|p| p.state()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionQuery {
    store_id: Option<String>,
    intent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteQuery {
    #[serde(default)]
    wait: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions/{id}", get(session_handler))
        .route("/sessions/{id}/execute", post(execute_handler))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .with_state(Arc::new(state))
}

pub async fn serve(reconciler: Reconciler) -> anyhow::Result<()> {
    let addr = reconciler.config().bind_addr.clone();
    let listener = TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "bpre web listening");
    axum::serve(listener, app(AppState::new(reconciler))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ReconcileConfig::from_env()?;
    let client = ApiClient::new(config.api_client_config())?;
    let source = Arc::new(HttpRosterSource::new(client));
    serve(Reconciler::new(source, config)).await
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

/// Runs Parsing and Matching on the raw upload. The session is kept even when
/// it halts so its error stays inspectable.
async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CreateSessionQuery>,
    body: String,
) -> Response {
    let intent = match query.intent.as_deref() {
        None | Some("") => BatchIntent::default(),
        Some(raw) => match raw.parse::<BatchIntent>() {
            Ok(intent) => intent,
            Err(message) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
        },
    };

    let mut session = ReconcileSession::new(query.store_id.as_deref(), intent);
    let outcome = state.reconciler.prepare(&mut session, &body).await;

    let entry = SessionEntry {
        session,
        progress: None,
        updated: Instant::now(),
    };
    let payload = entry.payload();
    let mut sessions = state.sessions.lock().await;
    sessions.insert(payload.session.id, entry);
    prune(&mut sessions, state.retention);
    drop(sessions);

    match outcome {
        Ok(_) => (StatusCode::CREATED, Json(payload)).into_response(),
        Err(err) => error_response(&err, Some(payload)),
    }
}

async fn session_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let sessions = state.sessions.lock().await;
    match sessions.get(&id) {
        Some(entry) => Json(entry.payload()).into_response(),
        None => not_found(id),
    }
}

/// Starts the batch on its own task so a dropped request never cancels
/// mutations already in flight. `?wait=true` answers once the batch settles.
async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExecuteQuery>,
) -> Response {
    let (job, tracker, guard) = {
        let mut sessions = state.sessions.lock().await;
        let Some(entry) = sessions.get_mut(&id) else {
            return not_found(id);
        };
        if entry.session.state() == SessionState::Executing {
            return error_response(&ReconcileError::SessionBusy, Some(entry.payload()));
        }
        let Some(store_id) = entry.session.store_id().map(str::to_string) else {
            return error_response(&ReconcileError::MissingStore, Some(entry.payload()));
        };
        let guard = match state.reconciler.claim_store(&store_id) {
            Ok(guard) => guard,
            Err(err) => return error_response(&err, Some(entry.payload())),
        };
        let job = match entry.session.begin_execution() {
            Ok(job) => job,
            Err(err) => return error_response(&err, Some(entry.payload())),
        };
        let tracker = Arc::new(ProgressTracker::new(job.targets.len()));
        entry.progress = Some(Arc::clone(&tracker));
        entry.updated = Instant::now();
        (job, tracker, guard)
    };

    // The batch runs on an inner task; the outer one settles the session even
    // when the inner one panics.
    let task_state = Arc::clone(&state);
    let handle = tokio::spawn(async move {
        let batch_state = Arc::clone(&task_state);
        let outcome = tokio::spawn(async move {
            batch_state.reconciler.run_batch(&job, &tracker).await
        })
        .await;

        let mut sessions = task_state.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&id) {
            close_session(&mut entry.session, outcome);
            entry.updated = Instant::now();
        }
        drop(guard);
        prune(&mut sessions, task_state.retention);
    });

    let status = if query.wait {
        if let Err(err) = handle.await {
            warn!(session_id = %id, error = %err, "batch task aborted");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "batch task aborted" })),
            )
                .into_response();
        }
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    let sessions = state.sessions.lock().await;
    match sessions.get(&id) {
        Some(entry) => (status, Json(entry.payload())).into_response(),
        None => not_found(id),
    }
}

fn status_for(err: &ReconcileError) -> StatusCode {
    match err {
        ReconcileError::Parse => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::MissingStore => StatusCode::BAD_REQUEST,
        ReconcileError::RosterFetch { .. } => StatusCode::BAD_GATEWAY,
        ReconcileError::InvalidTransition { .. } | ReconcileError::SessionBusy => {
            StatusCode::CONFLICT
        }
    }
}

fn error_response(err: &ReconcileError, session: Option<SessionPayload>) -> Response {
    (
        status_for(err),
        Json(json!({
            "error": err.to_string(),
            "detail": err.detail(),
            "session": session,
        })),
    )
        .into_response()
}

fn not_found(id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("session {id} not found") })),
    )
        .into_response()
}
