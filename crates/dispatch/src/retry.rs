//! Retry and failover loop
//!
//! One relay runs: pre-consume, then up to `1 + max_retries` attempts, then
//! settle on success or refund on terminal failure. Each attempt selects a
//! channel (excluding everything already tried), rotates a key, and drives
//! the channel's adapter. Every failed attempt is reported to the health
//! manager before the retry decision is made.

use crate::adapter::{AdapterRegistry, RelayOutcome, UpstreamTarget};
use crate::cache::ChannelEntry;
use crate::context::{RelayContext, Usage};
use crate::error::{ErrorKind, RelayError, Result};
use crate::health::{FaultReport, HealthHandle};
use crate::quota::QuotaAdmission;
use crate::rotate::MultiKeyRotator;
use crate::select::ChannelSelector;
use bytes::Bytes;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decide whether the loop moves on after a failed attempt.
///
/// Order matters: a channel fault always retries, an origin-flagged skip
/// always stops, then budget, then pinning, then the status table.
pub fn should_retry(error: &RelayError, remaining: u32, pinned: bool) -> bool {
    if error.is_channel_fault() {
        return true;
    }
    if error.is_skip_retry() {
        return false;
    }
    if remaining == 0 {
        return false;
    }
    if pinned {
        return false;
    }
    match error.status() {
        429 | 307 => true,
        504 | 524 => false,
        s if s / 100 == 5 => true,
        400 | 408 => false,
        s if s / 100 == 2 => false,
        _ => true,
    }
}

#[derive(Clone)]
pub struct RetryCoordinator {
    selector: ChannelSelector,
    rotator: MultiKeyRotator,
    quota: QuotaAdmission,
    health: HealthHandle,
    adapters: Arc<dyn AdapterRegistry>,
    max_retries: u32,
}

impl RetryCoordinator {
    pub fn new(
        selector: ChannelSelector,
        rotator: MultiKeyRotator,
        quota: QuotaAdmission,
        health: HealthHandle,
        adapters: Arc<dyn AdapterRegistry>,
        max_retries: u32,
    ) -> Self {
        Self {
            selector,
            rotator,
            quota,
            health,
            adapters,
            max_retries,
        }
    }

    /// Run one relay end to end.
    pub async fn relay(&self, ctx: &mut RelayContext, body: Bytes) -> Result<RelayOutcome> {
        self.quota.pre_consume(ctx).await?;

        match self.attempt_loop(ctx, body).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.quota.refund(ctx).await;
                warn!(
                    request_id = %ctx.request_id,
                    model = %ctx.model,
                    trail = %ctx.trail_display(),
                    status = err.status(),
                    error = %err,
                    "relay failed"
                );
                Err(err)
            }
        }
    }

    async fn attempt_loop(&self, ctx: &mut RelayContext, body: Bytes) -> Result<RelayOutcome> {
        let mut exclude: HashSet<u64> = HashSet::new();
        let mut last_err: Option<RelayError> = None;

        for attempt in 0..=self.max_retries {
            let entry = match self.selector.select(ctx, &exclude).await {
                Ok(entry) => entry,
                // Pool exhausted mid-failover: surface the upstream error
                // that emptied it, not the selection error
                Err(err) => return Err(last_err.unwrap_or(err)),
            };
            ctx.trail.push(entry.config.id);
            exclude.insert(entry.config.id);
            counter!("relay_attempts_total").increment(1);

            match self.dispatch(ctx, &entry, body.clone()).await {
                Ok(outcome) => {
                    let usage = outcome.usage.clone().unwrap_or(Usage {
                        prompt_tokens: ctx.estimated_tokens,
                        completion_tokens: 0,
                    });
                    self.quota.settle(ctx, entry.config.id, &usage).await;
                    return Ok(outcome);
                }
                Err(err) => {
                    debug!(
                        request_id = %ctx.request_id,
                        channel_id = entry.config.id,
                        attempt,
                        status = err.status(),
                        error = %err,
                        "attempt failed"
                    );
                    self.health.report(FaultReport {
                        channel_id: entry.config.id,
                        channel_name: entry.config.name.clone(),
                        multi_key: entry.config.is_multi_key(),
                        key_index: ctx.key_index,
                        auto_ban: entry.config.auto_ban,
                        error: err.clone(),
                        request_id: ctx.request_id.clone(),
                        user_id: ctx.user_id,
                        token_id: ctx.token_id,
                        model: ctx.model.clone(),
                        group: ctx.group.clone(),
                        trail: ctx.trail.clone(),
                    });

                    let remaining = self.max_retries - attempt;
                    if !should_retry(&err, remaining, ctx.pinned_channel.is_some()) {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| RelayError::new(ErrorKind::Internal, "retry budget exhausted")))
    }

    async fn dispatch(
        &self,
        ctx: &mut RelayContext,
        entry: &ChannelEntry,
        body: Bytes,
    ) -> Result<RelayOutcome> {
        let picked = self.rotator.next_key(entry).await?;
        ctx.key_index = picked.index;

        let adapter = self.adapters.adapter_for(&entry.config.kind).ok_or_else(|| {
            RelayError::new(
                ErrorKind::Internal,
                format!("no adapter registered for kind {}", entry.config.kind),
            )
        })?;
        adapter.init(ctx)?;

        let target = UpstreamTarget {
            channel_id: entry.config.id,
            channel_name: entry.config.name.clone(),
            kind: entry.config.kind.clone(),
            base_url: entry.config.base_url.clone(),
            key: picked.key,
            key_index: picked.index,
        };
        let response = adapter.do_request(ctx, &target, body).await?;
        adapter.do_response(ctx, response).await
    }
}
