//! HTTP surface and the host-side chaining loop.
//!
//! One endpoint matters to the core: `POST /agents/{agent_id}/message`.
//! The response is a server-sent-event stream of framed JSON objects
//! terminated by a sentinel. The chaining loop lives here, not in the
//! engine: it re-enters `step` with the token-warning payload, a failure
//! heartbeat, or a requested heartbeat, bounded by `max_chaining_steps`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::{Agent, StepInput, StepOptions};
use crate::error::AgentError;
use crate::interface::{AgentInterface, Frame, StreamingInterface};
use crate::registry::{AgentRegistry, MetadataStore};
use crate::system::{
    get_heartbeat, get_token_limit_warning, package_user_message, FUNC_FAILED_HEARTBEAT_MESSAGE,
    REQ_HEARTBEAT_MESSAGE,
};

pub struct ServerState {
    pub registry: Arc<AgentRegistry>,
    pub metadata: Arc<dyn MetadataStore>,
    pub chaining: bool,
    pub max_chaining_steps: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UserMessageRequest {
    pub message: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/agents/{agent_id}/message", post(send_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn status_for(error: &AgentError) -> StatusCode {
    match error {
        AgentError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AgentError::Unauthorized => StatusCode::FORBIDDEN,
        AgentError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        AgentError::Busy(_) => StatusCode::LOCKED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Drive the step engine until the chain yields. Returns the completion
/// tokens accumulated across the chained steps.
pub async fn run_chain(
    agent: &mut Agent,
    chaining: bool,
    max_chaining_steps: Option<usize>,
    initial_input: String,
) -> Result<u32, AgentError> {
    let mut next_input = initial_input;
    let mut counter = 0usize;
    let mut tokens_accumulated = 0u32;
    let options = StepOptions::default();

    loop {
        let outcome = agent.step(StepInput::Raw(next_input), &options).await?;
        counter += 1;
        tokens_accumulated += outcome.completion_tokens;

        if !chaining {
            tracing::debug!("no chaining, stopping after one step");
            break;
        }
        if let Some(max) = max_chaining_steps {
            if counter > max {
                tracing::debug!(steps = counter, "hit max chaining steps");
                break;
            }
        }

        if outcome.memory_warning {
            next_input = get_token_limit_warning();
        } else if outcome.tool_failed {
            next_input = get_heartbeat(FUNC_FAILED_HEARTBEAT_MESSAGE);
        } else if outcome.heartbeat_request {
            next_input = get_heartbeat(REQ_HEARTBEAT_MESSAGE);
        } else {
            break;
        }
    }
    Ok(tokens_accumulated)
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UserMessageRequest>,
) -> Response {
    // Bearer token -> owner id; rejections are 403.
    let Some(token) = bearer_token(&headers) else {
        return error_response(StatusCode::FORBIDDEN, "Invalid credentials");
    };
    let Some(owner_id) = state.metadata.user_from_api_key(token) else {
        return error_response(StatusCode::FORBIDDEN, "Invalid credentials");
    };

    // Input sanitization happens before any state mutation.
    if request.message.is_empty() || request.message.starts_with('/') {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid input: '{}'", request.message),
        );
    }
    let packaged = match request.role.as_str() {
        "user" => package_user_message(&request.message, None),
        // System-authored text goes through unpackaged; the engine's
        // ingest handles JSON-shaped payloads itself.
        "system" => request.message.clone(),
        other => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Bad role {other}"));
        }
    };

    let mut guard = match state.registry.try_acquire(agent_id) {
        Ok(guard) => guard,
        Err(e) => return error_response(status_for(&e), &e.to_string()),
    };
    if guard.owner_id() != owner_id {
        return error_response(StatusCode::FORBIDDEN, "Invalid credentials");
    }

    let (interface, rx) = StreamingInterface::new();
    let interface = Arc::new(interface);
    guard.set_interface(interface.clone());

    let chaining = state.chaining;
    let max_chaining_steps = state.max_chaining_steps;
    tokio::spawn(async move {
        match run_chain(&mut guard, chaining, max_chaining_steps, packaged).await {
            Ok(tokens) => {
                tracing::debug!(tokens, agent_id = %agent_id, "finished agent step");
                interface.step_yield();
            }
            Err(e) => {
                tracing::error!(agent_id = %agent_id, "agent step failed: {e}");
                interface.error(&e.to_string());
            }
        }
        // guard drops here: the lock releases on every exit path
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    })
    .take_while(|frame| futures::future::ready(!matches!(frame, Frame::Stop)))
    .filter_map(|frame| async move {
        match frame {
            Frame::Data(value) => {
                Some(Ok::<Event, std::convert::Infallible>(Event::default().data(value.to_string())))
            }
            Frame::Stop => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
