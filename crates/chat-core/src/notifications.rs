use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{channel::ChannelError, conversations::ConversationIndex, types::ChatCommand};

/// Badge total derived from the conversation index.
///
/// Before the first snapshot lands, the value restored from durable storage
/// is added to whatever live deltas arrived; the snapshot supersedes it.
#[derive(Debug, Clone, Default)]
pub struct BadgeCounter {
    restored: Option<u64>,
    last_published: Option<u64>,
}

impl BadgeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the badge with a value persisted by a previous session.
    pub fn restore(&mut self, total: Option<u64>) {
        self.restored = total;
    }

    pub fn total(&self, index: &ConversationIndex) -> u64 {
        let live = index.unread_total();
        match self.restored {
            Some(restored) if !index.has_snapshot() => restored.saturating_add(live),
            _ => live,
        }
    }

    /// The new total when it differs from the last published one.
    pub fn publish(&mut self, index: &ConversationIndex) -> Option<u64> {
        let total = self.total(index);
        if self.last_published == Some(total) {
            return None;
        }
        debug!(total, "unread badge changed");
        self.last_published = Some(total);
        Some(total)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Handle for features outside the chat surface: badge total plus an
/// "open conversation X" entry point.
#[derive(Debug, Clone)]
pub struct NotificationBridge {
    commands: mpsc::Sender<ChatCommand>,
    unread: watch::Receiver<u64>,
}

impl NotificationBridge {
    pub fn new(commands: mpsc::Sender<ChatCommand>, unread: watch::Receiver<u64>) -> Self {
        Self { commands, unread }
    }

    /// Current badge total.
    pub fn unread_total(&self) -> u64 {
        *self.unread.borrow()
    }

    /// Wait for the next badge change and return the new total.
    pub async fn changed(&mut self) -> Option<u64> {
        self.unread.changed().await.ok()?;
        Some(*self.unread.borrow_and_update())
    }

    /// Open the conversation with `peer_id`, looking the peer up first when it is not cached.
    pub async fn focus_conversation(&self, peer_id: impl Into<String>) -> Result<(), ChannelError> {
        self.commands
            .send(ChatCommand::FocusConversation {
                peer_id: peer_id.into(),
            })
            .await
            .map_err(|_| ChannelError::CommandChannelClosed)
    }
}
