use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use rewind_agent_connection::{AgentConnector, AgentEvent};
use rewind_agent_error::{ErrorType, ProblemDetails, SessionError};
use rewind_agent_session::{run_turn, EventSink, SessionLease, SessionRegistry, TurnOutcome};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

const SSE_CHANNEL_SIZE: usize = 256;

#[derive(Debug)]
pub struct AppState {
    registry: SessionRegistry,
}

impl AppState {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            registry: SessionRegistry::new(connector),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/query", post(post_query))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id/interrupt", post(interrupt_session))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router);

    let http_logging = match std::env::var("REWIND_AGENT_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Closes every session's connection.
pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.registry.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_query, list_sessions, interrupt_session),
    components(
        schemas(
            HealthResponse,
            QueryRequest,
            SessionSummary,
            SessionListResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Agent sessions and turns")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2470")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Session(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct QueryRequest {
    pub prompt: String,
    /// Session id from the `init` record of an earlier response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub turns: usize,
    pub busy: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

#[utoipa::path(
    post,
    path = "/v1/query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "SSE stream of the turn's init, user, assistant and result records"),
        (status = 400, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(SessionError::InvalidRequest {
            message: "prompt must not be empty".to_string(),
        }
        .into());
    }
    let last_session_id = request
        .last_session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let lease = state.registry.acquire(last_session_id).await?;
    tracing::info!(session_id = ?lease.session_id(), "query: turn starting");

    let (sender, receiver) = mpsc::channel(SSE_CHANNEL_SIZE);
    // The turn belongs to the server, not the request: a client that goes
    // away stops receiving frames but the turn still runs to completion.
    tokio::spawn(run_web_turn(lease, prompt, sender));

    let stream = ReceiverStream::new(receiver).map(Ok::<Event, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    let sessions = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|info| SessionSummary {
            session_id: info.session_id,
            turns: info.turns,
            busy: info.busy,
            created_at_ms: info.created_at_ms,
        })
        .collect();
    Json(SessionListResponse { sessions })
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/interrupt",
    responses(
        (status = 204, description = "Interrupt requested"),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Agent session id")),
    tag = "sessions"
)]
async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.interrupt(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn run_web_turn(mut lease: SessionLease, prompt: String, sender: mpsc::Sender<Event>) {
    let connection = lease.connection();
    let interrupt = lease.arm_interrupt();
    let mut sink = SseSink {
        sender: sender.clone(),
    };

    let result = run_turn(
        connection.as_ref(),
        &mut lease,
        &prompt,
        &mut sink,
        &interrupt,
    )
    .await;

    let closing = match result {
        Ok(report) => {
            tracing::info!(
                session_id = ?report.session_id,
                recorded = report.recorded,
                outcome = ?report.outcome,
                "query: turn finished"
            );
            (report.outcome == TurnOutcome::Interrupted).then(|| {
                (
                    "interrupted",
                    ProblemDetails::new(
                        ErrorType::StreamInterrupted,
                        Some("response interrupted".to_string()),
                    ),
                )
            })
        }
        Err(err) => {
            tracing::warn!(error = %err, "query: turn failed");
            Some(("error", err.to_problem_details()))
        }
    };
    if let Some((name, problem)) = closing {
        match Event::default().event(name).json_data(&problem) {
            Ok(frame) => {
                let _ = sender.send(frame).await;
            }
            Err(err) => tracing::warn!(error = %err, "query: failed to encode closing frame"),
        }
    }

    drop(interrupt);
    lease.release().await;
}

/// Writes each record as an SSE frame named by its kind.
struct SseSink {
    sender: mpsc::Sender<Event>,
}

impl EventSink for SseSink {
    fn deliver<'a>(
        &'a mut self,
        event: &'a AgentEvent,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        async move {
            let frame = Event::default()
                .event(event.kind())
                .json_data(event)
                .map_err(|err| SessionError::StreamError {
                    message: err.to_string(),
                })?;
            self.sender
                .send(frame)
                .await
                .map_err(|_| SessionError::StreamError {
                    message: "client disconnected".to_string(),
                })
        }
        .boxed()
    }
}
