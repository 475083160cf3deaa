//! HTTP relay surface
//!
//! Thin handlers over `RetryCoordinator::relay`: authenticate the bearer
//! token, parse the minimum out of the body (model, stream flag), build the
//! relay context, and shape the outcome back into an HTTP response. The
//! relay itself runs in a spawned task so a client disconnect cannot cancel
//! settlement or refund mid-flight.

use crate::config::TokenConfig;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use dispatch::{
    CacheCounts, ChannelCache, Payload, RelayContext, RelayError, RetryCoordinator,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Which client-facing API shape a request came in through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFormat {
    Chat,
    Completion,
    Task,
}

impl RelayFormat {
    pub fn label(&self) -> &'static str {
        match self {
            RelayFormat::Chat => "chat",
            RelayFormat::Completion => "completions",
            RelayFormat::Task => "tasks",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            RelayFormat::Chat => "/v1/chat/completions",
            RelayFormat::Completion => "/v1/completions",
            RelayFormat::Task => "/v1/tasks",
        }
    }

    /// Tasks are submit-and-poll; they never stream.
    fn allows_stream(&self) -> bool {
        !matches!(self, RelayFormat::Task)
    }
}

/// Shared handler state.
pub struct AppState {
    pub coordinator: RetryCoordinator,
    pub tokens: HashMap<String, TokenConfig>,
    pub cache: ChannelCache,
}

/// The only fields the gateway reads out of a relay body.
#[derive(Debug, Deserialize)]
struct RelayRequestBody {
    model: Option<String>,
    #[serde(default)]
    stream: bool,
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_request(state, headers, body, RelayFormat::Chat).await
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_request(state, headers, body, RelayFormat::Completion).await
}

pub async fn tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_request(state, headers, body, RelayFormat::Task).await
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let counts: CacheCounts = state.cache.counts().await;
    let status = if counts.enabled > 0 {
        "healthy"
    } else {
        "unhealthy"
    };
    Json(serde_json::json!({
        "status": status,
        "channels": {
            "total": counts.total,
            "enabled": counts.enabled,
            "auto_disabled": counts.auto_disabled,
        }
    }))
    .into_response()
}

pub async fn relay_request(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    format: RelayFormat,
) -> Response {
    let request_id = format!("req_{}", Uuid::new_v4().simple());
    let start = Instant::now();

    let Some(token) = bearer_token(&headers).and_then(|key| state.tokens.get(key)) else {
        crate::metrics::record_request(format.label(), 401, start.elapsed().as_secs_f64());
        return json_error(401, "authentication_error", "invalid bearer token", &request_id);
    };

    let parsed: RelayRequestBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            crate::metrics::record_request(format.label(), 400, start.elapsed().as_secs_f64());
            return json_error(
                400,
                "invalid_request_error",
                &format!("request body is not valid JSON: {err}"),
                &request_id,
            );
        }
    };
    let Some(model) = parsed.model.filter(|m| !m.is_empty()) else {
        crate::metrics::record_request(format.label(), 400, start.elapsed().as_secs_f64());
        return json_error(
            400,
            "invalid_request_error",
            "model field is required",
            &request_id,
        );
    };
    let stream = parsed.stream && format.allows_stream();

    let mut ctx = RelayContext::new(
        request_id.clone(),
        model,
        token.group.clone(),
        token.user_id,
        token.token_id,
    );
    ctx.stream = stream;
    ctx.endpoint = format.endpoint().to_string();
    ctx.estimated_tokens = estimate_tokens(&body);
    ctx.pinned_channel = token.channel_id;

    // Run the relay detached so a dropped connection cannot cancel
    // settlement or refund
    let coordinator = state.coordinator.clone();
    let task = tokio::spawn(async move {
        let result = coordinator.relay(&mut ctx, body).await;
        (ctx, result)
    });

    let (ctx, result) = match task.await {
        Ok(outcome) => outcome,
        Err(err) => {
            crate::metrics::record_request(format.label(), 500, start.elapsed().as_secs_f64());
            return json_error(
                500,
                "internal_error",
                &format!("relay task failed: {err}"),
                &request_id,
            );
        }
    };

    match result {
        Ok(outcome) => {
            info!(
                request_id = %ctx.request_id,
                model = %ctx.model,
                format = format.label(),
                status = outcome.status,
                attempts = ctx.trail.len(),
                trail = %ctx.trail_display(),
                duration_ms = start.elapsed().as_millis() as u64,
                "relay complete"
            );
            crate::metrics::record_request(
                format.label(),
                outcome.status,
                start.elapsed().as_secs_f64(),
            );
            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);
            let content_type = HeaderValue::from_str(&outcome.content_type)
                .unwrap_or(HeaderValue::from_static("application/octet-stream"));
            match outcome.body {
                Payload::Full(bytes) => {
                    (status, [(CONTENT_TYPE, content_type)], bytes).into_response()
                }
                Payload::Stream(stream) => (
                    status,
                    [(CONTENT_TYPE, content_type)],
                    Body::from_stream(stream),
                )
                    .into_response(),
            }
        }
        Err(err) => {
            crate::metrics::record_request(
                format.label(),
                err.status(),
                start.elapsed().as_secs_f64(),
            );
            if stream {
                sse_error(&err, &ctx.request_id)
            } else {
                json_error(err.status(), err.kind().label(), err.message(), &ctx.request_id)
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Body-bytes heuristic for pre-consumption; real usage corrects it at
/// settlement.
pub(crate) fn estimate_tokens(body: &[u8]) -> u64 {
    (body.len() as u64 / 4).max(1)
}

fn error_payload(kind: &str, message: &str, request_id: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    })
}

fn json_error(status: u16, kind: &str, message: &str, request_id: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(error_payload(kind, message, request_id))).into_response()
}

/// Streaming clients get the terminal error as an in-band SSE frame so the
/// event stream terminates cleanly instead of with a bare HTTP error.
fn sse_error(err: &RelayError, request_id: &str) -> Response {
    let frame = format!(
        "data: {}\n\ndata: [DONE]\n\n",
        error_payload(err.kind().label(), err.message(), request_id)
    );
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))],
        frame,
    )
        .into_response()
}
