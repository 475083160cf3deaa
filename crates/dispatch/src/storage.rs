//! Storage seam
//!
//! The dispatch engine never touches a database or file directly; everything
//! durable goes through the `Storage` trait. The gateway binary provides a
//! file-backed implementation, tests use `MemoryStorage`.

use crate::channel::{Channel, ChannelStatus, KeyDisable};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Boxed future used by dyn-compatible async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("insufficient quota: available {available}, requested {requested}")]
    InsufficientQuota { available: i64, requested: u64 },

    #[error("channel {0} not found")]
    ChannelNotFound(u64),

    #[error("storage I/O: {0}")]
    Io(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One persisted relay failure.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorLogEntry {
    pub request_id: String,
    pub user_id: u64,
    pub token_id: u64,
    pub model: String,
    pub group: String,
    pub channel_id: u64,
    pub channel_name: String,
    pub kind: &'static str,
    pub status: u16,
    pub message: String,
    /// Channel ids tried before the failure, in order
    pub trail: Vec<u64>,
    /// Key index at fault for multi-key channels
    pub multi_key_index: Option<usize>,
    /// Unix timestamp (seconds)
    pub at: u64,
}

/// Durable state operations the engine depends on.
///
/// Quota methods must be atomic with respect to each other for a given user;
/// `pre_consume_quota` is a checked debit that fails rather than driving the
/// balance negative.
pub trait Storage: Send + Sync {
    /// Full channel set for a cache refresh.
    fn load_channels(&self) -> BoxFuture<'_, StorageResult<Vec<Channel>>>;

    /// Persist a channel-level status change.
    fn persist_channel_status(
        &self,
        channel_id: u64,
        status: ChannelStatus,
        reason: String,
    ) -> BoxFuture<'_, StorageResult<()>>;

    /// Persist a per-key disable record; `None` re-enables the index.
    fn persist_key_status(
        &self,
        channel_id: u64,
        key_index: usize,
        disable: Option<KeyDisable>,
    ) -> BoxFuture<'_, StorageResult<()>>;

    /// Persist a multi-key channel's polling cursor.
    fn persist_cursor(&self, channel_id: u64, cursor: usize) -> BoxFuture<'_, StorageResult<()>>;

    /// Debit `amount` from the user's balance, failing if it would go
    /// negative. Returns the balance after the debit.
    fn pre_consume_quota(&self, user_id: u64, amount: u64) -> BoxFuture<'_, StorageResult<i64>>;

    /// Unconditional balance adjustment (settlement delta, refunds).
    /// Returns the balance after the adjustment.
    fn adjust_quota(&self, user_id: u64, delta: i64) -> BoxFuture<'_, StorageResult<i64>>;

    /// Accumulate settled usage onto a channel's lifetime counter.
    fn add_channel_used_quota(
        &self,
        channel_id: u64,
        amount: u64,
    ) -> BoxFuture<'_, StorageResult<()>>;

    /// Append a failure record to the error log.
    fn record_error_log(&self, entry: ErrorLogEntry) -> BoxFuture<'_, StorageResult<()>>;
}

#[derive(Default)]
struct MemoryState {
    channels: Vec<Channel>,
    balances: HashMap<u64, i64>,
    channel_used: HashMap<u64, u64>,
    error_logs: Vec<ErrorLogEntry>,
    cursors: HashMap<u64, usize>,
    key_status: HashMap<(u64, usize), Option<KeyDisable>>,
    channel_status: HashMap<u64, (ChannelStatus, String)>,
}

/// In-memory storage for tests.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_channels(&self, channels: Vec<Channel>) {
        self.state.lock().await.channels = channels;
    }

    pub async fn set_balance(&self, user_id: u64, balance: i64) {
        self.state.lock().await.balances.insert(user_id, balance);
    }

    pub async fn balance(&self, user_id: u64) -> i64 {
        *self.state.lock().await.balances.get(&user_id).unwrap_or(&0)
    }

    pub async fn channel_used(&self, channel_id: u64) -> u64 {
        *self
            .state
            .lock()
            .await
            .channel_used
            .get(&channel_id)
            .unwrap_or(&0)
    }

    pub async fn error_logs(&self) -> Vec<ErrorLogEntry> {
        self.state.lock().await.error_logs.clone()
    }

    pub async fn persisted_cursor(&self, channel_id: u64) -> Option<usize> {
        self.state.lock().await.cursors.get(&channel_id).copied()
    }

    pub async fn persisted_channel_status(
        &self,
        channel_id: u64,
    ) -> Option<(ChannelStatus, String)> {
        self.state
            .lock()
            .await
            .channel_status
            .get(&channel_id)
            .cloned()
    }

    pub async fn persisted_key_status(
        &self,
        channel_id: u64,
        key_index: usize,
    ) -> Option<Option<KeyDisable>> {
        self.state
            .lock()
            .await
            .key_status
            .get(&(channel_id, key_index))
            .cloned()
    }
}

impl Storage for MemoryStorage {
    fn load_channels(&self) -> BoxFuture<'_, StorageResult<Vec<Channel>>> {
        Box::pin(async move { Ok(self.state.lock().await.channels.clone()) })
    }

    fn persist_channel_status(
        &self,
        channel_id: u64,
        status: ChannelStatus,
        reason: String,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .channel_status
                .insert(channel_id, (status, reason));
            Ok(())
        })
    }

    fn persist_key_status(
        &self,
        channel_id: u64,
        key_index: usize,
        disable: Option<KeyDisable>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .key_status
                .insert((channel_id, key_index), disable);
            Ok(())
        })
    }

    fn persist_cursor(&self, channel_id: u64, cursor: usize) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.state.lock().await.cursors.insert(channel_id, cursor);
            Ok(())
        })
    }

    fn pre_consume_quota(&self, user_id: u64, amount: u64) -> BoxFuture<'_, StorageResult<i64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let balance = state.balances.entry(user_id).or_insert(0);
            let requested = i64::try_from(amount)
                .map_err(|_| StorageError::Io("quota amount overflow".into()))?;
            if *balance < requested {
                return Err(StorageError::InsufficientQuota {
                    available: *balance,
                    requested: amount,
                });
            }
            *balance -= requested;
            Ok(*balance)
        })
    }

    fn adjust_quota(&self, user_id: u64, delta: i64) -> BoxFuture<'_, StorageResult<i64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let balance = state.balances.entry(user_id).or_insert(0);
            *balance += delta;
            Ok(*balance)
        })
    }

    fn add_channel_used_quota(
        &self,
        channel_id: u64,
        amount: u64,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            *self
                .state
                .lock()
                .await
                .channel_used
                .entry(channel_id)
                .or_insert(0) += amount;
            Ok(())
        })
    }

    fn record_error_log(&self, entry: ErrorLogEntry) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.state.lock().await.error_logs.push(entry);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pre_consume_debits_and_enforces_balance() {
        let storage = MemoryStorage::new();
        storage.set_balance(1, 100).await;

        let remaining = storage.pre_consume_quota(1, 60).await.unwrap();
        assert_eq!(remaining, 40);

        let err = storage.pre_consume_quota(1, 60).await.unwrap_err();
        match err {
            StorageError::InsufficientQuota {
                available,
                requested,
            } => {
                assert_eq!(available, 40);
                assert_eq!(requested, 60);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.balance(1).await, 40);
    }

    #[tokio::test]
    async fn adjust_quota_can_credit_and_debit() {
        let storage = MemoryStorage::new();
        storage.set_balance(1, 10).await;

        assert_eq!(storage.adjust_quota(1, 25).await.unwrap(), 35);
        assert_eq!(storage.adjust_quota(1, -5).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn channel_used_quota_accumulates() {
        let storage = MemoryStorage::new();
        storage.add_channel_used_quota(3, 10).await.unwrap();
        storage.add_channel_used_quota(3, 7).await.unwrap();
        assert_eq!(storage.channel_used(3).await, 17);
    }
}
