//! Error types for the ask-continue relay.

use std::time::Duration;

use thiserror::Error;

/// Errors that can cross the relay boundary into the tool layer.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Every round over every candidate endpoint failed.
    #[error("could not reach any editor extension after {rounds} rounds: {detail}")]
    DeliveryExhausted {
        /// Number of dispatch rounds attempted.
        rounds: u32,
        /// The last per-candidate failure observed.
        detail: String,
    },

    /// Discovery produced no candidate ports even after retrying.
    #[error("no editor extension endpoints discovered")]
    NoEndpoints,

    /// The human dismissed the request from the editor.
    #[error("user cancelled the conversation")]
    Cancelled,

    /// The pending entry was reaped before any response arrived.
    #[error("request timed out after {after:?} of inactivity")]
    Expired {
        /// The max age the entry exceeded.
        after: Duration,
    },

    /// The pending entry was removed without being resolved, e.g. by another
    /// holder of the shared `PendingTable` calling `remove` on it.
    #[error("pending request was dropped before it was resolved")]
    Abandoned,

    /// Every port in the callback range was already in use.
    #[error("no free callback port starting at {start} ({attempts} attempts)")]
    ListenerBindExhausted {
        /// First port tried.
        start: u16,
        /// How many consecutive ports were tried.
        attempts: u32,
    },

    /// Binding the callback listener failed for a reason other than address-in-use.
    #[error("callback listener bind failed: {0}")]
    ListenerBind(#[source] std::io::Error),

    /// An HTTP client construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    /// The human explicitly cancelled; an expected outcome, not a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The request expired through reaping.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }

    /// Delivery to the editor extension never succeeded.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Self::DeliveryExhausted { .. } | Self::NoEndpoints)
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
