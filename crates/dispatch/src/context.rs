//! Per-request relay context
//!
//! One `RelayContext` is created when a client request arrives and dropped
//! when the response (or terminal error) goes out. It owns nothing beyond
//! its own fields; channels and storage are reached through the components.

/// Token usage reported by an upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Ephemeral state for one client request.
#[derive(Debug, Clone)]
pub struct RelayContext {
    /// Correlation id attached to logs and the terminal error
    pub request_id: String,
    /// Target model as requested by the client
    pub model: String,
    /// Group the requesting token belongs to
    pub group: String,
    pub user_id: u64,
    pub token_id: u64,
    /// Whether the client asked for a streaming response
    pub stream: bool,
    /// Upstream path for this request, e.g. `/v1/chat/completions`
    pub endpoint: String,
    /// Estimated prompt tokens, used for pre-consumption
    pub estimated_tokens: u64,
    /// Quota debited before dispatch; zeroed by settle and refund
    pub pre_consumed: u64,
    /// Ordered ids of every channel tried so far
    pub trail: Vec<u64>,
    /// When set, selection returns exactly this channel and the retry loop
    /// never fails over away from it
    pub pinned_channel: Option<u64>,
    /// Key index used by the current attempt (multi-key channels)
    pub key_index: Option<usize>,
}

impl RelayContext {
    pub fn new(
        request_id: impl Into<String>,
        model: impl Into<String>,
        group: impl Into<String>,
        user_id: u64,
        token_id: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            group: group.into(),
            user_id,
            token_id,
            stream: false,
            endpoint: "/v1/chat/completions".to_string(),
            estimated_tokens: 0,
            pre_consumed: 0,
            trail: Vec::new(),
            pinned_channel: None,
            key_index: None,
        }
    }

    /// Human-readable trail for retry diagnostics, e.g. `3->7->2`.
    pub fn trail_display(&self) -> String {
        self.trail
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("->")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_sums_both_sides() {
        let usage = Usage {
            prompt_tokens: 120,
            completion_tokens: 30,
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn trail_display_joins_with_arrows() {
        let mut ctx = RelayContext::new("req_1", "gpt-4o", "default", 1, 1);
        ctx.trail = vec![3, 7, 2];
        assert_eq!(ctx.trail_display(), "3->7->2");
    }

    #[test]
    fn new_context_starts_clean() {
        let ctx = RelayContext::new("req_1", "gpt-4o", "default", 1, 1);
        assert_eq!(ctx.pre_consumed, 0);
        assert!(ctx.trail.is_empty());
        assert!(ctx.pinned_channel.is_none());
    }
}
