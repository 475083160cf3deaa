//! Relay dispatch engine
//!
//! Core of the gateway: decides which channel serves a request, which key
//! that channel uses, whether the caller can afford it, and what happens
//! when an attempt fails.
//!
//! The request path reads only in-memory state (the channel cache); storage
//! is reached for quota movements and asynchronously by the cache refresh
//! and health manager tasks. The HTTP surface lives in the gateway binary
//! and talks to this crate through `RetryCoordinator::relay`.

pub mod adapter;
pub mod cache;
pub mod channel;
pub mod context;
pub mod error;
pub mod health;
pub mod quota;
pub mod retry;
pub mod rotate;
pub mod select;
pub mod storage;

pub use adapter::{Adapter, AdapterRegistry, Payload, RelayOutcome, StaticAdapterRegistry, UpstreamResponse, UpstreamTarget};
pub use cache::{spawn_cache_refresh, CacheCounts, ChannelCache, ChannelEntry};
pub use channel::{Channel, ChannelStatus, KeyDisable, MultiKeyInfo, RotationMode};
pub use context::{RelayContext, Usage};
pub use error::{ErrorKind, RelayError, Result};
pub use health::{ChannelHealthManager, FaultReport, HealthHandle};
pub use quota::{ModelPrice, PriceTable, QuotaAdmission};
pub use retry::{should_retry, RetryCoordinator};
pub use rotate::{MultiKeyRotator, SelectedKey};
pub use select::ChannelSelector;
pub use storage::{BoxFuture, ErrorLogEntry, MemoryStorage, Storage, StorageError, StorageResult};
