//! Quota admission and settlement
//!
//! Quota is debited once before the attempt loop using the request's token
//! estimate, then reconciled exactly once at the end: `settle` against real
//! usage on success, `refund` of the untouched pre-consume on terminal
//! failure. Both zero `pre_consumed` so a second call is a no-op.

use crate::context::{RelayContext, Usage};
use crate::error::{ErrorKind, RelayError, Result};
use crate::storage::{Storage, StorageError};
use metrics::counter;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pricing for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub quota_per_1k_tokens: u64,
}

/// Model pricing table.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    default_quota_per_1k: u64,
    models: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new(default_quota_per_1k: u64, models: HashMap<String, ModelPrice>) -> Self {
        Self {
            default_quota_per_1k,
            models,
        }
    }

    /// Quota cost for `tokens` tokens of `model`. `None` means the model is
    /// free and skips admission entirely.
    pub fn quota_for(&self, model: &str, tokens: u64) -> Option<u64> {
        let per_1k = match self.models.get(model) {
            Some(price) if price.free => return None,
            Some(price) => price.quota_per_1k_tokens,
            None => self.default_quota_per_1k,
        };
        if per_1k == 0 {
            return None;
        }
        Some((tokens.saturating_mul(per_1k)).div_ceil(1000).max(1))
    }
}

/// Pre-consume, settle, refund.
#[derive(Clone)]
pub struct QuotaAdmission {
    storage: Arc<dyn Storage>,
    prices: PriceTable,
}

impl QuotaAdmission {
    pub fn new(storage: Arc<dyn Storage>, prices: PriceTable) -> Self {
        Self { storage, prices }
    }

    /// Debit the estimated cost before dispatch. Free models pass through
    /// without touching storage.
    pub async fn pre_consume(&self, ctx: &mut RelayContext) -> Result<()> {
        let Some(amount) = self.prices.quota_for(&ctx.model, ctx.estimated_tokens) else {
            return Ok(());
        };

        match self.storage.pre_consume_quota(ctx.user_id, amount).await {
            Ok(remaining) => {
                ctx.pre_consumed = amount;
                debug!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    amount,
                    remaining,
                    "quota pre-consumed"
                );
                Ok(())
            }
            Err(StorageError::InsufficientQuota {
                available,
                requested,
            }) => Err(RelayError::new(
                ErrorKind::QuotaExhausted,
                format!("quota exhausted: available {available}, requested {requested}"),
            )),
            Err(err) => Err(RelayError::new(
                ErrorKind::Storage,
                format!("quota pre-consume failed: {err}"),
            )),
        }
    }

    /// Reconcile against actual usage after a successful relay.
    ///
    /// Storage failures here are logged, not surfaced; the response has
    /// already been committed to the client.
    pub async fn settle(&self, ctx: &mut RelayContext, channel_id: u64, usage: &Usage) {
        let actual = self
            .prices
            .quota_for(&ctx.model, usage.total())
            .unwrap_or(0);
        let pre = ctx.pre_consumed;
        ctx.pre_consumed = 0;

        let delta = actual as i64 - pre as i64;
        if delta != 0
            && let Err(err) = self.storage.adjust_quota(ctx.user_id, -delta).await
        {
            warn!(
                request_id = %ctx.request_id,
                user_id = ctx.user_id,
                delta,
                error = %err,
                "quota settlement adjustment failed"
            );
        }

        if actual > 0
            && let Err(err) = self.storage.add_channel_used_quota(channel_id, actual).await
        {
            warn!(
                request_id = %ctx.request_id,
                channel_id,
                error = %err,
                "channel used-quota update failed"
            );
        }

        debug!(
            request_id = %ctx.request_id,
            user_id = ctx.user_id,
            channel_id,
            pre_consumed = pre,
            settled = actual,
            "quota settled"
        );
    }

    /// Return the untouched pre-consume after a terminal failure.
    pub async fn refund(&self, ctx: &mut RelayContext) {
        if ctx.pre_consumed == 0 {
            return;
        }
        let amount = ctx.pre_consumed;
        ctx.pre_consumed = 0;

        match self.storage.adjust_quota(ctx.user_id, amount as i64).await {
            Ok(_) => {
                counter!("relay_quota_refunds_total").increment(1);
                debug!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    amount,
                    "pre-consumed quota refunded"
                );
            }
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    amount,
                    error = %err,
                    "quota refund failed"
                );
            }
        }
    }
}
