//! In-memory channel cache
//!
//! Selection and rotation never hit storage on the request path; they read
//! from this cache. A background task rebuilds it from storage on an
//! interval, and the health manager mutates entry runtime state in place.
//!
//! Each entry carries its own `Mutex<ChannelRuntime>` so rotation and
//! disable decisions for one channel serialize without blocking the others.
//! The lock lives and dies with the entry, so a refresh that drops a
//! channel also drops its lock.

use crate::channel::{Channel, ChannelStatus, KeyDisable};
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Mutable per-channel state.
#[derive(Debug, Clone)]
pub struct ChannelRuntime {
    pub status: ChannelStatus,
    /// Sparse per-key disable map; an absent index is enabled
    pub disabled_keys: HashMap<usize, KeyDisable>,
    /// Next polling position
    pub cursor: usize,
}

/// One cached channel: immutable config snapshot plus runtime state.
#[derive(Debug)]
pub struct ChannelEntry {
    pub config: Channel,
    /// Credentials parsed once at cache build time
    pub keys: Vec<String>,
    pub state: Mutex<ChannelRuntime>,
}

impl ChannelEntry {
    fn from_channel(channel: Channel, carried_cursor: Option<usize>) -> Self {
        let keys = channel.parse_keys();
        let (disabled_keys, stored_cursor) = match &channel.multi_key {
            Some(info) => (info.disabled.clone(), info.cursor),
            None => (HashMap::new(), 0),
        };
        let cursor = carried_cursor.unwrap_or(stored_cursor);
        let cursor = if keys.is_empty() { 0 } else { cursor % keys.len() };
        Self {
            state: Mutex::new(ChannelRuntime {
                status: channel.status,
                disabled_keys,
                cursor,
            }),
            keys,
            config: channel,
        }
    }
}

/// Shared channel cache.
#[derive(Clone, Default)]
pub struct ChannelCache {
    inner: Arc<RwLock<HashMap<u64, Arc<ChannelEntry>>>>,
}

/// Channel counts reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounts {
    pub total: usize,
    pub enabled: usize,
    pub auto_disabled: usize,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a fresh channel set.
    ///
    /// When `carry_cursors` is true, polling cursors from surviving entries
    /// are kept instead of the stored ones, so an in-memory rotation
    /// position is not reset by a refresh.
    pub async fn replace(&self, channels: Vec<Channel>, carry_cursors: bool) {
        let carried: HashMap<u64, usize> = if carry_cursors {
            let current = self.inner.read().await;
            let mut cursors = HashMap::with_capacity(current.len());
            for (id, entry) in current.iter() {
                cursors.insert(*id, entry.state.lock().await.cursor);
            }
            cursors
        } else {
            HashMap::new()
        };

        let mut next = HashMap::with_capacity(channels.len());
        for channel in channels {
            let carried_cursor = carried.get(&channel.id).copied();
            next.insert(
                channel.id,
                Arc::new(ChannelEntry::from_channel(channel, carried_cursor)),
            );
        }

        let mut current = self.inner.write().await;
        *current = next;
        debug!(channels = current.len(), "channel cache replaced");
    }

    pub async fn get(&self, channel_id: u64) -> Option<Arc<ChannelEntry>> {
        self.inner.read().await.get(&channel_id).cloned()
    }

    /// All entries, for the selector's filter pass.
    pub async fn snapshot(&self) -> Vec<Arc<ChannelEntry>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Set a channel's runtime status. Returns false if the channel is not
    /// cached.
    pub async fn set_status(&self, channel_id: u64, status: ChannelStatus) -> bool {
        let Some(entry) = self.get(channel_id).await else {
            return false;
        };
        entry.state.lock().await.status = status;
        true
    }

    pub async fn counts(&self) -> CacheCounts {
        let entries = self.snapshot().await;
        let mut counts = CacheCounts {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match entry.state.lock().await.status {
                ChannelStatus::Enabled => counts.enabled += 1,
                ChannelStatus::AutoDisabled => counts.auto_disabled += 1,
                ChannelStatus::ManuallyDisabled => {}
            }
        }
        counts
    }
}

/// Spawn the periodic cache refresh task.
///
/// The first tick fires immediately and is skipped so a freshly started
/// gateway is not refreshed twice in a row; callers populate the cache once
/// before spawning this.
pub fn spawn_cache_refresh(
    cache: ChannelCache,
    storage: Arc<dyn Storage>,
    interval: Duration,
    carry_cursors: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.load_channels().await {
                Ok(channels) => {
                    let count = channels.len();
                    cache.replace(channels, carry_cursors).await;
                    info!(channels = count, "channel cache refreshed");
                }
                Err(err) => {
                    error!(error = %err, "channel cache refresh failed");
                }
            }
        }
    })
}
