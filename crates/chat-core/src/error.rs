use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectivityState;

/// Broad error category used for user-facing handling and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Invalid configuration or a request the server rejected as malformed.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Throttled by the server.
    RateLimited,
    /// Payload encoding/decoding failure.
    Serialization,
    /// Local persistence failure.
    Storage,
    /// User input rejected before anything was sent.
    Validation,
    /// Broken invariant inside the engine.
    Internal,
}

/// Stable error payload carried across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    pub category: ChatErrorCategory,
    /// Stable machine-readable code.
    pub code: String,
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Rejected user input.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Validation, code, message)
    }

    /// Transport failure.
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Network, code, message)
    }

    /// Session operation attempted from the wrong connectivity state.
    pub fn invalid_state(current: ConnectivityState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is {current:?}"),
        )
    }

    /// Whether a user-initiated retry of the same operation can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Network | ChatErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        408 | 429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Network,
        _ => ChatErrorCategory::Internal,
    }
}
