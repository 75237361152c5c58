use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_relay_error::{ErrorType, ProblemDetails, RelayError};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use crate::dispatch::CommandRequest;
use crate::protocol::{CommandKind, CommandReply};
use crate::registry::{AgentSummary, Registry};
use crate::socket::handle_agent_socket;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { api_key: None }
    }

    pub fn with_api_key(api_key: String) -> Self {
        Self {
            api_key: Some(api_key),
        }
    }
}

#[derive(Debug)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, auth: AuthConfig) -> Self {
        Self { registry, auth }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AgentListResponse {
    pub agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/:agent_id/execute", post(post_execute))
        .route("/commands", post(post_command))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let v1 = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/agents/connect", get(agent_connect))
        .merge(operator);

    let trace_layer = TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
        tracing::info_span!(
            "http.request",
            method = %req.method(),
            uri = %req.uri()
        )
    });

    Router::new()
        .nest("/v1", v1)
        .fallback(not_found)
        .layer(trace_layer)
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, list_agents, post_command, post_execute),
    components(schemas(
        HealthResponse,
        AgentListResponse,
        AgentSummary,
        CommandRequest,
        ExecuteRequest,
        CommandKind,
        CommandReply,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Connected agents"),
        (name = "commands", description = "Command relay")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.auth.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if provided == Some(expected) {
        return Ok(next.run(request).await);
    }

    tracing::warn!(path = %request.uri().path(), "rejected request with missing or invalid api key");
    Err(ApiError::Relay(RelayError::Unauthorized {
        message: Some("missing or invalid api key".to_string()),
    }))
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

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses(
        (status = 200, body = AgentListResponse),
        (status = 401, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.registry.list().await,
    })
}

#[utoipa::path(
    post,
    path = "/v1/commands",
    request_body = CommandRequest,
    responses(
        (status = 200, body = CommandReply),
        (status = 400, body = ProblemDetails),
        (status = 401, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 408, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "commands"
)]
async fn post_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<CommandReply>, ApiError> {
    let Json(request) = payload.map_err(invalid_body)?;
    let reply = state.registry.execute(request).await?;
    Ok(Json(reply))
}

#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, body = CommandReply),
        (status = 400, body = ProblemDetails),
        (status = 401, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 408, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    params(("agent_id" = String, Path, description = "Agent id")),
    tag = "commands"
)]
async fn post_execute(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<CommandReply>, ApiError> {
    let Json(body) = payload.map_err(invalid_body)?;
    let reply = state
        .registry
        .execute(CommandRequest {
            agent_id: Some(agent_id),
            kind: Some(CommandKind::Execute),
            command: body.command,
            timer: None,
            timeout_ms: body.timeout_ms,
        })
        .await?;
    Ok(Json(reply))
}

async fn agent_connect(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_agent_socket(registry, socket))
}

async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: ErrorType::InvalidRequest.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    };

    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    ApiError::Relay(RelayError::InvalidRequest {
        message: rejection.body_text(),
    })
}
