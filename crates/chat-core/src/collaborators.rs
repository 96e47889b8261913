//! Narrow capability interfaces for the external collaborators.
//!
//! The runtime receives these as constructor arguments; nothing in the engine
//! reaches for a global channel or client.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    error::ChatError,
    types::{Conversation, HistoryPage, OutboundMessage, PeerProfile, PushEvent},
};

/// Authenticated REST endpoints for history, conversations and the user directory.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// One page of history with `peer_id`, skipping the `skip` most recent messages.
    async fn fetch_history(
        &self,
        peer_id: &str,
        limit: u16,
        skip: u32,
    ) -> Result<HistoryPage, ChatError>;

    /// The caller's conversation summaries.
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError>;

    /// Directory search. An empty query lists verified users.
    async fn search_users(&self, query: &str) -> Result<Vec<PeerProfile>, ChatError>;

    /// Directory lookup by user ID.
    async fn fetch_user(&self, user_id: &str) -> Result<PeerProfile, ChatError>;
}

/// Persistent push connection.
///
/// Implementations own reconnection; they report lifecycle changes as
/// [`PushEvent::Link`] and never surface drops as errors.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Start connecting. Calling it again is a no-op.
    fn connect(&self);

    /// Subscribe to inbound events.
    fn subscribe(&self) -> broadcast::Receiver<PushEvent>;

    /// Bind this connection to `user_id` on the server.
    async fn register_identity(&self, user_id: &str) -> Result<(), ChatError>;

    /// Emit an outbound message.
    async fn send(&self, message: OutboundMessage) -> Result<(), ChatError>;
}
