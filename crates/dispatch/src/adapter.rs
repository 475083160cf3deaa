//! Upstream adapter seam
//!
//! The retry loop drives every attempt through an `Adapter`: build and send
//! the upstream request, then shape the upstream response into a relay
//! outcome. Adapters are keyed by channel kind through a registry so new
//! provider formats plug in without touching the loop.

use crate::context::{RelayContext, Usage};
use crate::error::Result;
use crate::storage::BoxFuture;
use bytes::Bytes;
use common::Secret;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved destination for one attempt.
pub struct UpstreamTarget {
    pub channel_id: u64,
    pub channel_name: String,
    pub kind: String,
    pub base_url: String,
    pub key: Secret<String>,
    /// Key index within a multi-key channel
    pub key_index: Option<usize>,
}

/// Response body, buffered or streaming.
pub enum Payload {
    Full(Bytes),
    Stream(BoxStream<'static, std::result::Result<Bytes, std::io::Error>>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Raw upstream response handed to `do_response`.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Payload,
}

/// Final shaped outcome of a successful attempt.
#[derive(Debug)]
pub struct RelayOutcome {
    pub status: u16,
    pub content_type: String,
    pub body: Payload,
    /// Token usage when the upstream reported it; settlement falls back to
    /// the request estimate otherwise
    pub usage: Option<Usage>,
}

/// One provider format.
///
/// `do_request` must classify failures at their origin: a connect failure is
/// a channel fault, an HTTP error status goes through `RelayError::upstream`.
pub trait Adapter: Send + Sync {
    /// Kind tag this adapter serves, matched against `Channel::kind`.
    fn kind(&self) -> &'static str;

    /// Per-attempt setup before the request is sent.
    fn init(&self, ctx: &RelayContext) -> Result<()>;

    /// Send the request upstream.
    fn do_request<'a>(
        &'a self,
        ctx: &'a RelayContext,
        target: &'a UpstreamTarget,
        body: Bytes,
    ) -> BoxFuture<'a, Result<UpstreamResponse>>;

    /// Shape the upstream response into the relay outcome.
    fn do_response<'a>(
        &'a self,
        ctx: &'a RelayContext,
        response: UpstreamResponse,
    ) -> BoxFuture<'a, Result<RelayOutcome>>;
}

/// Adapter lookup by channel kind.
pub trait AdapterRegistry: Send + Sync {
    fn adapter_for(&self, kind: &str) -> Option<Arc<dyn Adapter>>;
}

/// Fixed registry built at startup.
#[derive(Default)]
pub struct StaticAdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn Adapter>>,
}

impl StaticAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }
}

impl AdapterRegistry for StaticAdapterRegistry {
    fn adapter_for(&self, kind: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(kind).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedAdapter;
    use super::*;

    #[test]
    fn registry_resolves_by_kind() {
        let registry = StaticAdapterRegistry::new()
            .register(Arc::new(ScriptedAdapter::new("openai", vec![])));

        assert!(registry.adapter_for("openai").is_some());
        assert!(registry.adapter_for("unknown").is_none());
    }

    #[test]
    fn payload_debug_is_opaque_about_contents() {
        use futures_util::StreamExt;

        let full = Payload::Full(Bytes::from_static(b"abcd"));
        assert_eq!(format!("{full:?}"), "Full(4)");

        let stream = Payload::Stream(
            futures_util::stream::empty::<std::result::Result<Bytes, std::io::Error>>().boxed(),
        );
        assert_eq!(format!("{stream:?}"), "Stream(..)");
    }
}
