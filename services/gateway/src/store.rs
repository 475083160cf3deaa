//! File-backed storage
//!
//! A single JSON state file holds channels, user balances, and per-channel
//! usage counters. All writes go through atomic temp-file + rename, and a
//! tokio Mutex serializes them; quota movements are atomic because the debit
//! check and the write happen under the same lock. The error log is a
//! separate append-only JSONL file.

use dispatch::{
    BoxFuture, Channel, ChannelStatus, ErrorLogEntry, KeyDisable, Storage, StorageError,
    StorageResult,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Everything the state file holds.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    channels: Vec<Channel>,
    /// User id to remaining quota
    #[serde(default)]
    balances: HashMap<u64, i64>,
    /// Channel id to lifetime settled quota
    #[serde(default)]
    channel_used: HashMap<u64, u64>,
}

/// Thread-safe state file manager.
pub struct FileStore {
    path: PathBuf,
    error_log_path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Load state from the given file path.
    ///
    /// If the file doesn't exist, creates it empty so a cold start serves
    /// (and fails) cleanly until channels are added.
    pub async fn load(path: PathBuf, error_log_path: PathBuf) -> StorageResult<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StorageError::Io(format!("reading state file: {e}")))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| StorageError::Io(format!("parsing state file: {e}")))?;
            info!(
                path = %path.display(),
                channels = state.channels.len(),
                users = state.balances.len(),
                "loaded state"
            );
            state
        } else {
            info!(path = %path.display(), "state file not found, starting empty");
            let state = StoreState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            error_log_path,
            state: Mutex::new(state),
        })
    }

    async fn with_channel<F>(&self, channel_id: u64, mutate: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Channel),
    {
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .iter_mut()
            .find(|c| c.id == channel_id)
            .ok_or(StorageError::ChannelNotFound(channel_id))?;
        mutate(channel);
        write_atomic(&self.path, &state).await
    }
}

impl Storage for FileStore {
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
            debug!(channel_id, status = status.label(), reason, "persisting channel status");
            self.with_channel(channel_id, |channel| channel.status = status)
                .await
        })
    }

    fn persist_key_status(
        &self,
        channel_id: u64,
        key_index: usize,
        disable: Option<KeyDisable>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.with_channel(channel_id, |channel| {
                let info = channel.multi_key.get_or_insert_with(Default::default);
                match disable {
                    Some(record) => {
                        info.disabled.insert(key_index, record);
                    }
                    None => {
                        info.disabled.remove(&key_index);
                    }
                }
            })
            .await
        })
    }

    fn persist_cursor(&self, channel_id: u64, cursor: usize) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.with_channel(channel_id, |channel| {
                if let Some(info) = channel.multi_key.as_mut() {
                    info.cursor = cursor;
                }
            })
            .await
        })
    }

    fn pre_consume_quota(&self, user_id: u64, amount: u64) -> BoxFuture<'_, StorageResult<i64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let requested = i64::try_from(amount)
                .map_err(|_| StorageError::Io("quota amount overflow".into()))?;
            let balance = state.balances.entry(user_id).or_insert(0);
            if *balance < requested {
                return Err(StorageError::InsufficientQuota {
                    available: *balance,
                    requested: amount,
                });
            }
            *balance -= requested;
            let remaining = *balance;
            write_atomic(&self.path, &state).await?;
            Ok(remaining)
        })
    }

    fn adjust_quota(&self, user_id: u64, delta: i64) -> BoxFuture<'_, StorageResult<i64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let balance = state.balances.entry(user_id).or_insert(0);
            *balance += delta;
            let remaining = *balance;
            write_atomic(&self.path, &state).await?;
            Ok(remaining)
        })
    }

    fn add_channel_used_quota(
        &self,
        channel_id: u64,
        amount: u64,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            *state.channel_used.entry(channel_id).or_insert(0) += amount;
            write_atomic(&self.path, &state).await
        })
    }

    fn record_error_log(&self, entry: ErrorLogEntry) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut line = serde_json::to_string(&entry)
                .map_err(|e| StorageError::Io(format!("serializing error log entry: {e}")))?;
            line.push('\n');

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.error_log_path)
                .await
                .map_err(|e| StorageError::Io(format!("opening error log: {e}")))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| StorageError::Io(format!("appending error log: {e}")))?;
            Ok(())
        })
    }
}

/// Write state to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets 0600 permissions since the file contains channel keys.
async fn write_atomic(path: &Path, state: &StoreState) -> StorageResult<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| StorageError::Io(format!("serializing state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Io("state path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StorageError::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StorageError::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StorageError::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "persisted state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch::{MultiKeyInfo, RotationMode};

    fn test_channel(id: u64) -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("chan-{id}"),
            "kind": "openai",
            "base_url": "https://upstream.example",
            "models": ["gpt-4o"],
            "key": "sk-a\nsk-b",
            "multi_key": { "mode": "polling" }
        }))
        .unwrap()
    }

    async fn store_with(dir: &tempfile::TempDir, channels: Vec<Channel>) -> FileStore {
        let path = dir.path().join("state.json");
        let log_path = dir.path().join("error-log.jsonl");
        let state = StoreState {
            channels,
            balances: HashMap::from([(1, 100)]),
            channel_used: HashMap::new(),
        };
        write_atomic(&path, &state).await.unwrap();
        FileStore::load(path, log_path).await.unwrap()
    }

    #[tokio::test]
    async fn cold_start_creates_empty_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        assert!(!path.exists());
        let store = FileStore::load(path.clone(), dir.path().join("log.jsonl"))
            .await
            .unwrap();
        assert!(path.exists());
        assert!(store.load_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_movements_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, vec![test_channel(1)]).await;

        assert_eq!(store.pre_consume_quota(1, 30).await.unwrap(), 70);
        assert_eq!(store.adjust_quota(1, 10).await.unwrap(), 80);
        store.add_channel_used_quota(1, 25).await.unwrap();

        let reloaded = FileStore::load(
            dir.path().join("state.json"),
            dir.path().join("error-log.jsonl"),
        )
        .await
        .unwrap();
        assert_eq!(
            reloaded.pre_consume_quota(1, 80).await.unwrap(),
            0,
            "balance of 80 must have survived the reload"
        );
    }

    #[tokio::test]
    async fn pre_consume_rejects_overdraft_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, vec![]).await;

        let err = store.pre_consume_quota(1, 200).await.unwrap_err();
        assert!(matches!(err, StorageError::InsufficientQuota { .. }));
        assert_eq!(store.pre_consume_quota(1, 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn key_disable_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, vec![test_channel(1)]).await;

        store
            .persist_key_status(
                1,
                0,
                Some(KeyDisable {
                    reason: "invalid api key".into(),
                    disabled_at: 1_700_000_000,
                }),
            )
            .await
            .unwrap();
        store.persist_cursor(1, 1).await.unwrap();

        let channels = FileStore::load(
            dir.path().join("state.json"),
            dir.path().join("error-log.jsonl"),
        )
        .await
        .unwrap()
        .load_channels()
        .await
        .unwrap();
        let info = channels[0].multi_key.as_ref().unwrap();
        assert_eq!(info.disabled.get(&0).unwrap().reason, "invalid api key");
        assert_eq!(info.cursor, 1);
        assert_eq!(info.mode, RotationMode::Polling);
    }

    #[tokio::test]
    async fn channel_status_persists_and_missing_channel_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, vec![test_channel(1)]).await;

        store
            .persist_channel_status(1, ChannelStatus::AutoDisabled, "all keys disabled".into())
            .await
            .unwrap();
        let channels = store.load_channels().await.unwrap();
        assert_eq!(channels[0].status, ChannelStatus::AutoDisabled);

        let err = store
            .persist_channel_status(99, ChannelStatus::AutoDisabled, "gone".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChannelNotFound(99)));
    }

    #[tokio::test]
    async fn error_log_appends_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, vec![]).await;

        for i in 0..2 {
            store
                .record_error_log(ErrorLogEntry {
                    request_id: format!("req_{i}"),
                    user_id: 1,
                    token_id: 1,
                    model: "gpt-4o".into(),
                    group: "default".into(),
                    channel_id: 3,
                    channel_name: "chan-3".into(),
                    kind: "upstream_transient",
                    status: 502,
                    message: "bad gateway".into(),
                    trail: vec![3],
                    multi_key_index: None,
                    at: 1_700_000_000,
                })
                .await
                .unwrap();
        }

        let contents = tokio::fs::read_to_string(dir.path().join("error-log.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["channel_id"], 3);
            assert_eq!(value["status"], 502);
        }
    }

    #[tokio::test]
    async fn multi_key_info_default_used_by_test_channel() {
        let ch = test_channel(1);
        let info: &MultiKeyInfo = ch.multi_key.as_ref().unwrap();
        assert!(info.disabled.is_empty());
        assert_eq!(info.cursor, 0);
    }
}
