//! OpenAI-compatible upstream adapter
//!
//! Relays the request body verbatim to `{base_url}{endpoint}` with the
//! channel's key as a bearer token. Connection-level failures classify as
//! channel faults, reqwest timeouts as upstream timeouts, and error statuses
//! go through the status classifier with whatever message the upstream body
//! carries.

use bytes::Bytes;
use dispatch::storage::BoxFuture;
use dispatch::{
    Adapter, ErrorKind, Payload, RelayContext, RelayError, RelayOutcome, UpstreamResponse,
    UpstreamTarget, Usage,
};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

const MAX_UPSTREAM_MESSAGE_LEN: usize = 512;

pub struct OpenAiAdapter {
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Adapter for OpenAiAdapter {
    fn kind(&self) -> &'static str {
        "openai"
    }

    fn init(&self, _ctx: &RelayContext) -> dispatch::Result<()> {
        Ok(())
    }

    fn do_request<'a>(
        &'a self,
        ctx: &'a RelayContext,
        target: &'a UpstreamTarget,
        body: Bytes,
    ) -> BoxFuture<'a, dispatch::Result<UpstreamResponse>> {
        Box::pin(async move {
            let url = join_url(&target.base_url, &ctx.endpoint);
            let response = self
                .client
                .post(&url)
                .bearer_auth(target.key.expose())
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(classify_send_error)?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();

            if !(200..300).contains(&status) {
                let text = response.text().await.unwrap_or_default();
                return Err(RelayError::upstream(
                    status,
                    extract_upstream_message(status, &text),
                ));
            }

            let body = if ctx.stream {
                Payload::Stream(
                    response
                        .bytes_stream()
                        .map_err(std::io::Error::other)
                        .boxed(),
                )
            } else {
                Payload::Full(response.bytes().await.map_err(|e| {
                    RelayError::new(
                        ErrorKind::UpstreamTransient,
                        format!("reading upstream body: {e}"),
                    )
                })?)
            };

            Ok(UpstreamResponse {
                status,
                content_type,
                body,
            })
        })
    }

    fn do_response<'a>(
        &'a self,
        _ctx: &'a RelayContext,
        response: UpstreamResponse,
    ) -> BoxFuture<'a, dispatch::Result<RelayOutcome>> {
        Box::pin(async move {
            let usage = match &response.body {
                Payload::Full(bytes) => extract_usage(bytes),
                // Streaming usage arrives (if at all) inside SSE frames the
                // gateway does not parse; settlement uses the estimate
                Payload::Stream(_) => None,
            };
            Ok(RelayOutcome {
                status: response.status,
                content_type: response.content_type,
                body: response.body,
                usage,
            })
        })
    }
}

fn join_url(base_url: &str, endpoint: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), endpoint)
}

fn classify_send_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::new(
            ErrorKind::UpstreamTimeout,
            format!("upstream timed out: {err}"),
        )
    } else {
        RelayError::new(
            ErrorKind::ChannelFault,
            format!("upstream request failed: {err}"),
        )
    }
}

/// Pull a human-readable message out of an upstream error body.
///
/// OpenAI-compatible backends put it at `error.message`; anything else falls
/// back to the raw body, truncated.
fn extract_upstream_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        && !message.is_empty()
    {
        return truncate(message);
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("upstream returned status {status}")
    } else {
        truncate(trimmed)
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_UPSTREAM_MESSAGE_LEN {
        return message.to_string();
    }
    let mut cut = MAX_UPSTREAM_MESSAGE_LEN;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut])
}

fn extract_usage(bytes: &Bytes) -> Option<Usage> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let usage = value.get("usage")?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()?,
        completion_tokens: usage.get("completion_tokens").and_then(|v| v.as_u64())?,
    })
}
