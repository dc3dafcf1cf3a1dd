// HTTP route handlers for the perfenv API

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use perfenv_core::{EnvError, Evaluator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::{AppState, Session};

#[derive(Debug, Deserialize)]
pub struct StepRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub env_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub env_id: Uuid,
    pub episode_id: Option<Uuid>,
    pub observation: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

fn parse_env_id(env_id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(env_id)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid environment ID format"))
}

async fn find_session(state: &AppState, env_id: &str) -> Result<(Uuid, Arc<Mutex<Evaluator>>), Response> {
    let id = parse_env_id(env_id)?;
    let sessions = state.sessions.read().await;
    match sessions.get(&id) {
        Some(session) => {
            session.touch();
            Ok((id, session.evaluator.clone()))
        }
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Environment {} not found", id),
        )),
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn metrics() -> Response {
    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics")
        }
    }
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| {
            let mime = mime.trim();
            mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Config mapping from a create request; an empty body means the defaults
fn parse_config_body(headers: &HeaderMap, body: &[u8]) -> Result<serde_json::Value, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    if !is_json_content_type(headers) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Expected request with `Content-Type: application/json`",
        ));
    }
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON body: {}", e),
        )
    })
}

/// POST /envs - Create an environment from a configuration mapping
///
/// An empty body uses the defaults.
pub async fn create_env(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = match parse_config_body(&headers, &body) {
        Ok(config) => config,
        Err(response) => return response,
    };

    let evaluator = match Evaluator::with_engine(&config, state.engine.clone()) {
        Ok(evaluator) => evaluator,
        Err(e) => {
            warn!(error = %e, "Rejected environment configuration");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    if state.sessions.read().await.len() >= state.limits.max_sessions {
        state.evict_idle(Utc::now()).await;
    }

    let env_id = Uuid::new_v4();
    {
        let mut sessions = state.sessions.write().await;
        if sessions.len() >= state.limits.max_sessions {
            warn!(max_sessions = state.limits.max_sessions, "Session table full");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "Session limit of {} reached; delete an environment first",
                    state.limits.max_sessions
                ),
            );
        }
        sessions.insert(env_id, Session::new(evaluator));
    }
    metrics::ACTIVE_SESSIONS.inc();

    info!(env_id = %env_id, "Environment created");
    (StatusCode::CREATED, Json(CreateResponse { env_id })).into_response()
}

/// GET /envs/{env_id} - Environment state and configuration
pub async fn get_env(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
) -> Response {
    let id = match parse_env_id(&env_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let (evaluator, created_at) = {
        let sessions = state.sessions.read().await;
        match sessions.get(&id) {
            Some(session) => {
                session.touch();
                (session.evaluator.clone(), session.created_at)
            }
            None => {
                return error_response(StatusCode::NOT_FOUND, format!("Environment {} not found", id))
            }
        }
    };

    let evaluator = evaluator.lock().await;
    let episode = evaluator.episode();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "env_id": id,
            "created_at": created_at,
            "state": evaluator.state().as_str(),
            "episode_id": episode.map(|e| e.id),
            "episode_started_at": episode.map(|e| e.started_at),
            "steps": episode.map(|e| e.steps).unwrap_or(0),
            "config": evaluator.config(),
        })),
    )
        .into_response()
}

/// POST /envs/{env_id}/reset - Start a new episode
pub async fn reset_env(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
) -> Response {
    let (id, evaluator) = match find_session(&state, &env_id).await {
        Ok(found) => found,
        Err(response) => return response,
    };

    let mut evaluator = evaluator.lock().await;
    let observation = evaluator.reset();
    let episode_id = evaluator.episode().map(|e| e.id);

    (
        StatusCode::OK,
        Json(ResetResponse {
            env_id: id,
            episode_id,
            observation,
        }),
    )
        .into_response()
}

/// POST /envs/{env_id}/step - Score one submission
pub async fn step_env(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
    Json(payload): Json<StepRequest>,
) -> Response {
    let (id, evaluator) = match find_session(&state, &env_id).await {
        Ok(found) => found,
        Err(response) => return response,
    };

    let started = Instant::now();
    let result = evaluator.lock().await.step(&payload.code).await;
    metrics::STEP_DURATION.observe(started.elapsed().as_secs_f64());

    match result {
        Ok(step) => {
            let outcome = step.info.error_kind.map(|k| k.as_str()).unwrap_or("ok");
            metrics::STEPS_TOTAL.with_label_values(&[outcome]).inc();
            metrics::REWARD.observe(step.reward);
            info!(env_id = %id, outcome = outcome, reward = step.reward, "Step served");
            (StatusCode::OK, Json(step)).into_response()
        }
        Err(e) if e.is_usage_error() => {
            metrics::STEPS_TOTAL.with_label_values(&["usage_error"]).inc();
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e @ EnvError::Engine(_)) => {
            metrics::STEPS_TOTAL.with_label_values(&["engine_error"]).inc();
            error!(env_id = %id, error = %e, "Execution engine failure");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DELETE /envs/{env_id} - Drop an environment
pub async fn delete_env(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
) -> Response {
    let id = match parse_env_id(&env_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.sessions.write().await.remove(&id) {
        Some(_) => {
            metrics::ACTIVE_SESSIONS.dec();
            info!(env_id = %id, "Environment deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("Environment {} not found", id)),
    }
}
