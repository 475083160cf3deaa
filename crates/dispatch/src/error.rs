//! Relay error classification
//!
//! Every failure in the dispatch engine carries a `RelayError`: an error
//! kind, an HTTP status code, and three flags fixed at construction time.
//! The retry loop and the health manager read the flags; nothing downstream
//! re-derives them from the message or status.

use thiserror::Error;

/// Classification of a relay failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad client input, never retried
    Validation,
    /// Caller's balance cannot cover the pre-consume amount
    QuotaExhausted,
    /// Candidate pool empty for this group/model — terminal within a request
    NoAvailableChannel,
    /// Multi-key channel with every key disabled; the channel fails but
    /// failover to a different channel is still allowed
    NoAvailableKey,
    /// Fault attributed to the channel itself (connect failure, bad
    /// credential material), always retried while budget remains
    ChannelFault,
    /// Upstream 504/524 — retrying would compound latency
    UpstreamTimeout,
    /// Upstream 4xx other than 429
    UpstreamPermanent,
    /// Upstream 5xx/429/307
    UpstreamTransient,
    /// Storage collaborator failure
    Storage,
    /// Gateway-side bug or misconfiguration
    Internal,
}

impl ErrorKind {
    /// Stable label for logs and error-log records.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::NoAvailableChannel => "no_available_channel",
            ErrorKind::NoAvailableKey => "no_available_key",
            ErrorKind::ChannelFault => "channel_fault",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamPermanent => "upstream_permanent",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A classified relay failure.
///
/// Flags are set once by the constructor for the kind and are never
/// mutated afterwards.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RelayError {
    kind: ErrorKind,
    status: u16,
    message: String,
    skip_retry: bool,
    channel_fault: bool,
    record_log: bool,
}

impl RelayError {
    /// Build an error with the default status and flags for its kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let (status, skip_retry, channel_fault, record_log) = match kind {
            ErrorKind::Validation => (400, true, false, false),
            ErrorKind::QuotaExhausted => (403, true, false, false),
            ErrorKind::NoAvailableChannel => (503, true, false, false),
            ErrorKind::NoAvailableKey => (503, false, true, true),
            ErrorKind::ChannelFault => (502, false, true, true),
            ErrorKind::UpstreamTimeout => (504, false, false, true),
            ErrorKind::UpstreamPermanent => (400, false, false, true),
            ErrorKind::UpstreamTransient => (502, false, false, true),
            ErrorKind::Storage => (500, true, false, true),
            ErrorKind::Internal => (500, true, false, true),
        };
        Self {
            kind,
            status,
            message: message.into(),
            skip_retry,
            channel_fault,
            record_log,
        }
    }

    /// Classify an upstream response status at its origin.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            504 | 524 => ErrorKind::UpstreamTimeout,
            429 | 307 => ErrorKind::UpstreamTransient,
            s if s / 100 == 5 => ErrorKind::UpstreamTransient,
            s if s / 100 == 4 => ErrorKind::UpstreamPermanent,
            _ => ErrorKind::UpstreamTransient,
        };
        Self::new(kind, message).with_status(status)
    }

    /// Override the HTTP status while keeping kind and flags.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Forces immediate loop termination regardless of budget.
    pub fn is_skip_retry(&self) -> bool {
        self.skip_retry
    }

    /// The channel itself is unhealthy; always retried while budget remains.
    pub fn is_channel_fault(&self) -> bool {
        self.channel_fault
    }

    /// Worth persisting to the error log when logging is enabled.
    pub fn should_record(&self) -> bool {
        self.record_log
    }
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_available_channel_is_skip_retry() {
        let err = RelayError::new(ErrorKind::NoAvailableChannel, "pool empty");
        assert!(err.is_skip_retry());
        assert!(!err.is_channel_fault());
        assert_eq!(err.status(), 503);
    }

    #[test]
    fn no_available_key_is_channel_fault_not_skip_retry() {
        let err = RelayError::new(ErrorKind::NoAvailableKey, "no enabled keys");
        assert!(err.is_channel_fault());
        assert!(!err.is_skip_retry());
    }

    #[test]
    fn upstream_classifies_timeouts() {
        assert_eq!(
            RelayError::upstream(504, "gateway timeout").kind(),
            ErrorKind::UpstreamTimeout
        );
        assert_eq!(
            RelayError::upstream(524, "origin timeout").kind(),
            ErrorKind::UpstreamTimeout
        );
    }

    #[test]
    fn upstream_classifies_transient_and_permanent() {
        assert_eq!(
            RelayError::upstream(429, "rate limited").kind(),
            ErrorKind::UpstreamTransient
        );
        assert_eq!(
            RelayError::upstream(503, "unavailable").kind(),
            ErrorKind::UpstreamTransient
        );
        assert_eq!(
            RelayError::upstream(404, "model not found").kind(),
            ErrorKind::UpstreamPermanent
        );
        assert_eq!(
            RelayError::upstream(307, "redirect").kind(),
            ErrorKind::UpstreamTransient
        );
    }

    #[test]
    fn upstream_preserves_original_status() {
        let err = RelayError::upstream(524, "origin timeout");
        assert_eq!(err.status(), 524);
    }

    #[test]
    fn display_is_the_message() {
        let err = RelayError::new(ErrorKind::Validation, "model field missing");
        assert_eq!(err.to_string(), "model field missing");
    }
}
