//! Multi-key rotation
//!
//! Single-key channels hand out their blob as-is. Multi-key channels pick
//! the next enabled index under the entry's state lock: polling mode scans
//! forward from the cursor with wraparound and advances the cursor past the
//! pick, random mode draws uniformly among enabled indices. Cursor
//! persistence is best-effort and happens after the lock is released.

use crate::cache::ChannelEntry;
use crate::channel::RotationMode;
use crate::error::{ErrorKind, RelayError, Result};
use crate::storage::Storage;
use common::Secret;
use rand::RngExt;
use std::sync::Arc;
use tracing::warn;

/// A credential picked for one attempt.
#[derive(Debug)]
pub struct SelectedKey {
    pub key: Secret<String>,
    /// Index within the channel's key list; `None` for single-key channels
    pub index: Option<usize>,
}

#[derive(Clone)]
pub struct MultiKeyRotator {
    storage: Arc<dyn Storage>,
    persist_cursors: bool,
}

impl MultiKeyRotator {
    pub fn new(storage: Arc<dyn Storage>, persist_cursors: bool) -> Self {
        Self {
            storage,
            persist_cursors,
        }
    }

    /// Pick the credential for the next attempt on this channel.
    pub async fn next_key(&self, entry: &ChannelEntry) -> Result<SelectedKey> {
        let Some(info) = &entry.config.multi_key else {
            return Ok(SelectedKey {
                key: Secret::new(entry.config.key.clone()),
                index: None,
            });
        };

        if entry.keys.is_empty() {
            return Err(RelayError::new(
                ErrorKind::NoAvailableKey,
                format!("channel {} has no keys configured", entry.config.id),
            ));
        }

        let (index, cursor_after) = {
            let mut state = entry.state.lock().await;
            let enabled: Vec<usize> = (0..entry.keys.len())
                .filter(|i| !state.disabled_keys.contains_key(i))
                .collect();
            if enabled.is_empty() {
                return Err(RelayError::new(
                    ErrorKind::NoAvailableKey,
                    format!("channel {} has all keys disabled", entry.config.id),
                ));
            }

            match info.mode {
                RotationMode::Random => {
                    // ThreadRng is not Send, draw before any await
                    let pick = enabled[rand::rng().random_range(0..enabled.len())];
                    (pick, None)
                }
                RotationMode::Polling => {
                    let len = entry.keys.len();
                    let start = state.cursor % len;
                    let mut found = start;
                    for offset in 0..len {
                        let candidate = (start + offset) % len;
                        if !state.disabled_keys.contains_key(&candidate) {
                            found = candidate;
                            break;
                        }
                    }
                    state.cursor = (found + 1) % len;
                    (found, Some(state.cursor))
                }
            }
        };

        if let Some(cursor) = cursor_after
            && self.persist_cursors
            && let Err(err) = self.storage.persist_cursor(entry.config.id, cursor).await
        {
            warn!(
                channel_id = entry.config.id,
                error = %err,
                "failed to persist rotation cursor"
            );
        }

        Ok(SelectedKey {
            key: Secret::new(entry.keys[index].clone()),
            index: Some(index),
        })
    }
}
