//! Channel selection
//!
//! Candidates are filtered on group, model, runtime status, and the
//! request's exclusion trail, then narrowed to the highest priority tier
//! present, and finally drawn weighted-random within that tier. A pinned
//! request bypasses all of it and resolves its channel directly.

use crate::cache::{ChannelCache, ChannelEntry};
use crate::channel::ChannelStatus;
use crate::context::RelayContext;
use crate::error::{ErrorKind, RelayError, Result};
use rand::RngExt;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct ChannelSelector {
    cache: ChannelCache,
}

impl ChannelSelector {
    pub fn new(cache: ChannelCache) -> Self {
        Self { cache }
    }

    /// Pick the channel for the next attempt.
    ///
    /// `exclude` holds channels already tried this request; a pinned channel
    /// ignores the exclusion set so a retriable fault on it surfaces through
    /// the retry decision instead of an empty pool.
    pub async fn select(
        &self,
        ctx: &RelayContext,
        exclude: &HashSet<u64>,
    ) -> Result<Arc<ChannelEntry>> {
        if let Some(pinned) = ctx.pinned_channel {
            return match self.cache.get(pinned).await {
                Some(entry) => Ok(entry),
                None => Err(RelayError::new(
                    ErrorKind::NoAvailableChannel,
                    format!("pinned channel {pinned} is not available"),
                )),
            };
        }

        let mut candidates = Vec::new();
        for entry in self.cache.snapshot().await {
            if exclude.contains(&entry.config.id) {
                continue;
            }
            if !entry.config.in_group(&ctx.group) || !entry.config.supports_model(&ctx.model) {
                continue;
            }
            if entry.state.lock().await.status != ChannelStatus::Enabled {
                continue;
            }
            candidates.push(entry);
        }

        if candidates.is_empty() {
            return Err(RelayError::new(
                ErrorKind::NoAvailableChannel,
                format!(
                    "no enabled channel serves model {} for group {}",
                    ctx.model, ctx.group
                ),
            ));
        }

        let top_priority = candidates
            .iter()
            .map(|e| e.config.priority)
            .max()
            .unwrap_or(0);
        candidates.retain(|e| e.config.priority == top_priority);

        Ok(weighted_draw(candidates))
    }
}

fn weighted_draw(candidates: Vec<Arc<ChannelEntry>>) -> Arc<ChannelEntry> {
    let total: u64 = candidates
        .iter()
        .map(|e| u64::from(e.config.selection_weight()))
        .sum();
    // ThreadRng is not Send, keep the draw out of any await
    let mut point = rand::rng().random_range(0..total);
    for entry in &candidates {
        let weight = u64::from(entry.config.selection_weight());
        if point < weight {
            return Arc::clone(entry);
        }
        point -= weight;
    }
    // Unreachable with a correct total, but never panic on the request path
    Arc::clone(candidates.last().unwrap())
}
