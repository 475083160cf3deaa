//! Channel health manager
//!
//! Every failed attempt is reported off the request path through a bounded
//! queue. A single consumer task applies disable decisions to the cache,
//! persists them, and writes the error log. If the queue is full the report
//! is dropped with a warning; health bookkeeping must never add latency or
//! backpressure to a relay.

use crate::cache::ChannelCache;
use crate::channel::{ChannelStatus, KeyDisable};
use crate::error::{ErrorKind, RelayError};
use crate::storage::{ErrorLogEntry, Storage};
use metrics::counter;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// One failed attempt, as seen by the health manager.
#[derive(Debug)]
pub struct FaultReport {
    pub channel_id: u64,
    pub channel_name: String,
    pub multi_key: bool,
    /// Key index used by the failing attempt, when the channel is multi-key
    pub key_index: Option<usize>,
    pub auto_ban: bool,
    pub error: RelayError,
    pub request_id: String,
    pub user_id: u64,
    pub token_id: u64,
    pub model: String,
    pub group: String,
    pub trail: Vec<u64>,
}

/// Sender half handed to the retry loop.
#[derive(Clone)]
pub struct HealthHandle {
    tx: mpsc::Sender<FaultReport>,
}

impl HealthHandle {
    /// Queue a fault report without blocking.
    pub fn report(&self, report: FaultReport) {
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                warn!(
                    channel_id = report.channel_id,
                    request_id = %report.request_id,
                    "health queue full, dropping fault report"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("health manager stopped, dropping fault report");
            }
        }
    }
}

/// Owns the consumer task.
pub struct ChannelHealthManager {
    handle: HealthHandle,
    stop: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl ChannelHealthManager {
    pub fn spawn(
        cache: ChannelCache,
        storage: Arc<dyn Storage>,
        error_log_enabled: bool,
        queue_capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<FaultReport>(queue_capacity);
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    report = rx.recv() => match report {
                        Some(report) => {
                            process_report(&cache, storage.as_ref(), error_log_enabled, report)
                                .await;
                        }
                        None => break,
                    },
                    _ = stop_signal.notified() => break,
                }
            }
            // Reports queued before the stop signal still get applied
            while let Ok(report) = rx.try_recv() {
                process_report(&cache, storage.as_ref(), error_log_enabled, report).await;
            }
        });
        Self {
            handle: HealthHandle { tx },
            stop,
            task,
        }
    }

    pub fn handle(&self) -> HealthHandle {
        self.handle.clone()
    }

    /// Stop the consumer after draining already-queued reports.
    ///
    /// Signals the task explicitly rather than waiting for every cloned
    /// `HealthHandle` to drop; the retry coordinator holds one for its whole
    /// lifetime. Reports sent after shutdown are dropped by the handle.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        drop(self.handle);
        if let Err(err) = self.task.await {
            warn!(error = %err, "health manager task ended abnormally");
        }
    }
}

/// Whether a fault justifies disabling the channel or key that produced it.
///
/// Credential and billing failures (401, 402, 403) will not heal on their
/// own; transient upstream trouble does.
fn is_durable_fault(error: &RelayError) -> bool {
    error.kind() == ErrorKind::NoAvailableKey || matches!(error.status(), 401 | 402 | 403)
}

async fn process_report(
    cache: &ChannelCache,
    storage: &dyn Storage,
    error_log_enabled: bool,
    report: FaultReport,
) {
    if is_durable_fault(&report.error) && report.auto_ban {
        apply_disable(cache, storage, &report).await;
    }

    if error_log_enabled && report.error.should_record() {
        let entry = ErrorLogEntry {
            request_id: report.request_id.clone(),
            user_id: report.user_id,
            token_id: report.token_id,
            model: report.model.clone(),
            group: report.group.clone(),
            channel_id: report.channel_id,
            channel_name: report.channel_name.clone(),
            kind: report.error.kind().label(),
            status: report.error.status(),
            message: report.error.message().to_string(),
            trail: report.trail.clone(),
            multi_key_index: report.key_index,
            at: now(),
        };
        if let Err(err) = storage.record_error_log(entry).await {
            warn!(
                request_id = %report.request_id,
                error = %err,
                "failed to record error log"
            );
        }
    }
}

async fn apply_disable(cache: &ChannelCache, storage: &dyn Storage, report: &FaultReport) {
    let Some(entry) = cache.get(report.channel_id).await else {
        debug!(
            channel_id = report.channel_id,
            "fault for a channel no longer cached"
        );
        return;
    };

    if report.multi_key
        && let Some(index) = report.key_index
    {
        let disable = KeyDisable {
            reason: report.error.message().to_string(),
            disabled_at: now(),
        };
        let promote = {
            let mut state = entry.state.lock().await;
            state.disabled_keys.insert(index, disable.clone());
            let exhausted = state.disabled_keys.len() >= entry.keys.len();
            if exhausted && state.status == ChannelStatus::Enabled {
                state.status = ChannelStatus::AutoDisabled;
            }
            exhausted
        };

        counter!("relay_channel_disabled_total", "scope" => "key").increment(1);
        info!(
            channel_id = report.channel_id,
            channel = %report.channel_name,
            key_index = index,
            reason = %report.error.message(),
            "key auto-disabled"
        );
        if let Err(err) = storage
            .persist_key_status(report.channel_id, index, Some(disable))
            .await
        {
            warn!(
                channel_id = report.channel_id,
                key_index = index,
                error = %err,
                "failed to persist key disable"
            );
        }

        if promote {
            disable_channel(storage, report, "all keys disabled").await;
        }
        return;
    }

    let was_enabled = {
        let mut state = entry.state.lock().await;
        let was_enabled = state.status == ChannelStatus::Enabled;
        if was_enabled {
            state.status = ChannelStatus::AutoDisabled;
        }
        was_enabled
    };
    if was_enabled {
        disable_channel(storage, report, report.error.message()).await;
    }
}

async fn disable_channel(storage: &dyn Storage, report: &FaultReport, reason: &str) {
    counter!("relay_channel_disabled_total", "scope" => "channel").increment(1);
    info!(
        channel_id = report.channel_id,
        channel = %report.channel_name,
        reason,
        "channel auto-disabled"
    );
    if let Err(err) = storage
        .persist_channel_status(
            report.channel_id,
            ChannelStatus::AutoDisabled,
            reason.to_string(),
        )
        .await
    {
        warn!(
            channel_id = report.channel_id,
            error = %err,
            "failed to persist channel disable"
        );
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::{channel, multi_key_channel};
    use crate::channel::RotationMode;
    use crate::storage::MemoryStorage;

    fn report(channel_id: u64, error: RelayError) -> FaultReport {
        FaultReport {
            channel_id,
            channel_name: format!("chan-{channel_id}"),
            multi_key: false,
            key_index: None,
            auto_ban: true,
            error,
            request_id: "req_t".into(),
            user_id: 1,
            token_id: 1,
            model: "gpt-4o".into(),
            group: "default".into(),
            trail: vec![channel_id],
        }
    }

    #[tokio::test]
    async fn durable_fault_disables_single_key_channel() {
        let cache = ChannelCache::new();
        cache.replace(vec![channel(1, 0, 1)], false).await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        manager
            .handle()
            .report(report(1, RelayError::upstream(401, "invalid api key")));
        manager.shutdown().await;

        let entry = cache.get(1).await.unwrap();
        assert_eq!(entry.state.lock().await.status, ChannelStatus::AutoDisabled);
        let (status, _reason) = storage.persisted_channel_status(1).await.unwrap();
        assert_eq!(status, ChannelStatus::AutoDisabled);
        assert_eq!(storage.error_logs().await.len(), 1);
    }

    #[tokio::test]
    async fn transient_fault_logs_but_does_not_disable() {
        let cache = ChannelCache::new();
        cache.replace(vec![channel(1, 0, 1)], false).await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        manager
            .handle()
            .report(report(1, RelayError::upstream(500, "upstream blew up")));
        manager.shutdown().await;

        let entry = cache.get(1).await.unwrap();
        assert_eq!(entry.state.lock().await.status, ChannelStatus::Enabled);
        assert!(storage.persisted_channel_status(1).await.is_none());
        assert_eq!(storage.error_logs().await.len(), 1);
    }

    #[tokio::test]
    async fn auto_ban_off_suppresses_disable() {
        let cache = ChannelCache::new();
        cache.replace(vec![channel(1, 0, 1)], false).await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        let mut r = report(1, RelayError::upstream(401, "invalid api key"));
        r.auto_ban = false;
        manager.handle().report(r);
        manager.shutdown().await;

        let entry = cache.get(1).await.unwrap();
        assert_eq!(entry.state.lock().await.status, ChannelStatus::Enabled);
        assert_eq!(storage.error_logs().await.len(), 1);
    }

    #[tokio::test]
    async fn key_fault_disables_one_index() {
        let cache = ChannelCache::new();
        cache
            .replace(
                vec![multi_key_channel(1, &["k0", "k1"], RotationMode::Polling)],
                false,
            )
            .await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        let mut r = report(1, RelayError::upstream(401, "invalid api key"));
        r.multi_key = true;
        r.key_index = Some(0);
        manager.handle().report(r);
        manager.shutdown().await;

        let entry = cache.get(1).await.unwrap();
        let state = entry.state.lock().await;
        assert!(state.disabled_keys.contains_key(&0));
        assert!(!state.disabled_keys.contains_key(&1));
        assert_eq!(state.status, ChannelStatus::Enabled);
        drop(state);
        assert!(storage.persisted_key_status(1, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn last_key_disable_promotes_channel() {
        let cache = ChannelCache::new();
        cache
            .replace(
                vec![multi_key_channel(1, &["k0", "k1"], RotationMode::Polling)],
                false,
            )
            .await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        for index in [0usize, 1] {
            let mut r = report(1, RelayError::upstream(401, "invalid api key"));
            r.multi_key = true;
            r.key_index = Some(index);
            manager.handle().report(r);
        }
        manager.shutdown().await;

        let entry = cache.get(1).await.unwrap();
        assert_eq!(entry.state.lock().await.status, ChannelStatus::AutoDisabled);
        let (status, reason) = storage.persisted_channel_status(1).await.unwrap();
        assert_eq!(status, ChannelStatus::AutoDisabled);
        assert_eq!(reason, "all keys disabled");
    }

    #[tokio::test]
    async fn no_available_key_fault_disables_multi_key_channel() {
        let cache = ChannelCache::new();
        cache
            .replace(
                vec![multi_key_channel(1, &["k0", "k1"], RotationMode::Polling)],
                false,
            )
            .await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        let mut r = report(
            1,
            RelayError::new(ErrorKind::NoAvailableKey, "channel 1 has all keys disabled"),
        );
        r.multi_key = true;
        manager.handle().report(r);
        manager.shutdown().await;

        let entry = cache.get(1).await.unwrap();
        assert_eq!(entry.state.lock().await.status, ChannelStatus::AutoDisabled);
    }

    #[tokio::test]
    async fn shutdown_completes_while_handle_clones_live() {
        let cache = ChannelCache::new();
        cache.replace(vec![channel(1, 0, 1)], false).await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), true, 16);

        // a long-lived clone like the retry coordinator's
        let held = manager.handle();
        held.report(report(1, RelayError::upstream(401, "invalid api key")));

        tokio::time::timeout(std::time::Duration::from_secs(5), manager.shutdown())
            .await
            .expect("shutdown must not wait on live handle clones");

        // the report queued before shutdown was still applied
        let entry = cache.get(1).await.unwrap();
        assert_eq!(entry.state.lock().await.status, ChannelStatus::AutoDisabled);
        drop(held);
    }

    #[tokio::test]
    async fn error_log_can_be_disabled() {
        let cache = ChannelCache::new();
        cache.replace(vec![channel(1, 0, 1)], false).await;
        let storage = MemoryStorage::new();
        let manager =
            ChannelHealthManager::spawn(cache.clone(), Arc::new(storage.clone()), false, 16);

        manager
            .handle()
            .report(report(1, RelayError::upstream(500, "upstream blew up")));
        manager.shutdown().await;

        assert!(storage.error_logs().await.is_empty());
    }
}
