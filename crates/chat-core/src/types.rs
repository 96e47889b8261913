use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Push-channel connectivity as tracked by the session manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    /// No transport connection.
    #[default]
    Disconnected,
    /// Transport is attempting to (re)connect.
    Connecting,
    /// Transport is connected but the identity binding has not been sent yet.
    Connected,
    /// Transport is connected and the server routes pushes to this user.
    Registered,
}

/// Link state reported by a push transport. Registration is not a transport concern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Local delivery state of a timeline entry.
///
/// Optimistic sends start as `Pending` and move to `Confirmed` or `Failed`;
/// a failed entry returns to `Pending` only through a user retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeliveryState {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

/// One chat message between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned ID, absent until the message is persisted.
    pub id: Option<String>,
    /// Client-generated ID for locally originated messages.
    pub client_id: Option<String>,
    /// Sender user ID.
    pub from: String,
    /// Recipient user ID.
    pub to: String,
    /// Message body.
    pub text: String,
    /// Send instant.
    pub timestamp: DateTime<Utc>,
    /// Local delivery state.
    pub delivery: DeliveryState,
}

impl Message {
    /// Build a confirmed message without server or client IDs.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            client_id: None,
            from: from.into(),
            to: to.into(),
            text: text.into(),
            timestamp,
            delivery: DeliveryState::Confirmed,
        }
    }

    /// Attach a server-assigned ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a client-generated ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.delivery == DeliveryState::Failed
    }

    /// Identity surrogate `from|to|timestamp` used before a server ID exists.
    pub fn surrogate_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.from,
            self.to,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    /// Whether `other` describes the same message.
    ///
    /// Server IDs win when both sides carry one, then client IDs, then the
    /// identity surrogate.
    pub fn same_message(&self, other: &Message) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.client_id, &other.client_id) {
            return a == b;
        }
        self.surrogate_key() == other.surrogate_key()
    }

    /// The other participant from the point of view of `self_id`.
    pub fn counterpart(&self, self_id: &str) -> &str {
        if self.to == self_id {
            &self.from
        } else {
            &self.to
        }
    }

    /// Whether this message belongs to the conversation between `self_id` and `peer_id`.
    pub fn involves(&self, self_id: &str, peer_id: &str) -> bool {
        (self.from == self_id && self.to == peer_id) || (self.from == peer_id && self.to == self_id)
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Counterpart user ID (unique key).
    pub peer_id: String,
    /// Best-effort display name; empty until directory metadata is known.
    pub peer_display_name: String,
    /// Body of the newest known message.
    pub last_message_text: String,
    /// Instant of the newest known message.
    pub last_message_timestamp: Option<DateTime<Utc>>,
    /// Messages from the peer not yet seen by the user.
    pub unread_count: u64,
}

impl Conversation {
    /// Empty conversation row for `peer_id`.
    pub fn new(peer_id: impl Into<String>, peer_display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_display_name: peer_display_name.into(),
            last_message_text: String::new(),
            last_message_timestamp: None,
            unread_count: 0,
        }
    }
}

/// Directory entry for a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerProfile {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl PeerProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }

    /// Name when set, otherwise email. May be empty.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

/// Order a history endpoint declares for the records it returns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HistoryOrder {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
    /// The endpoint makes no promise; the order is detected from timestamps.
    #[default]
    Unspecified,
}

/// One page of message history as returned by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub order: HistoryOrder,
    /// Records the server returned, including any that failed to decode.
    /// Only this count decides whether older history remains.
    pub received: usize,
}

impl HistoryPage {
    pub fn new(messages: Vec<Message>, order: HistoryOrder) -> Self {
        let received = messages.len();
        Self {
            messages,
            order,
            received,
        }
    }

    /// Override the raw record count when some records were dropped while decoding.
    pub fn with_received(mut self, received: usize) -> Self {
        self.received = received.max(self.messages.len());
        self
    }
}

/// Message emitted over the push channel by the send pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub client_id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Server acknowledgement for an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Client ID of the acknowledged message.
    pub client_id: String,
    /// Server ID on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Events delivered by a push channel implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// Locally observed transport lifecycle.
    Link(LinkState),
    /// Inbound message delivery.
    Message(Message),
    /// Acknowledgement for a message this client sent.
    SendAck(SendAck),
}

/// Engine tuning supplied when the runtime is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// History page size. A shorter page ends backward pagination.
    pub page_size: u16,
    /// Quiet period before a directory search is issued.
    pub search_debounce_ms: u64,
    /// Treat a successful hand-off to the push channel as confirmation.
    ///
    /// Use this when the server never acknowledges sends.
    pub confirm_on_dispatch: bool,
    /// How many merged message identities the conversation index remembers.
    pub seen_message_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            search_debounce_ms: 300,
            confirm_on_dispatch: false,
            seen_message_capacity: 512,
        }
    }
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Bind the authenticated user, restore cached badge state, connect and load conversations.
    Start {
        user_id: String,
    },
    /// Drop the identity binding and every piece of per-user state.
    SignOut,
    /// Re-fetch the conversation snapshot.
    RefreshConversations,
    /// Open a conversation from the conversation list.
    OpenConversation {
        peer_id: String,
    },
    /// Open a conversation with a user picked from directory search.
    OpenFromSearch {
        user: PeerProfile,
    },
    /// Open a conversation by peer ID, looking the peer up when it is not cached.
    FocusConversation {
        peer_id: String,
    },
    /// Close the open conversation.
    CloseConversation,
    /// Fetch the next older history page for the open conversation.
    LoadOlderPage,
    /// Tab/widget visibility change.
    SetVisible {
        visible: bool,
    },
    /// Compose and send a message.
    SendMessage {
        peer_id: String,
        text: String,
    },
    /// Re-send a failed message.
    RetrySend {
        client_id: String,
    },
    /// Debounced directory search. An empty query lists verified users.
    SearchUsers {
        query: String,
    },
}

/// What changed in the open timeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineChange {
    /// Timeline was cleared for a newly opened conversation.
    Reset,
    /// A history page was merged.
    ///
    /// `prepended` counts entries added ahead of previously visible content
    /// so the consumer can keep its scroll position anchored.
    PageLoaded {
        page_index: u32,
        prepended: usize,
        has_more: bool,
    },
    /// A message was inserted.
    Appended,
    /// An existing entry changed delivery state or was replaced by its canonical copy.
    Reconciled,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Session connectivity transition.
    ConnectivityChanged { state: ConnectivityState },
    /// Conversation list in recency order.
    ConversationsUpdated { conversations: Vec<Conversation> },
    /// Badge total changed.
    UnreadTotalChanged { total: u64 },
    /// Open timeline contents after a change.
    TimelineUpdated {
        peer_id: String,
        change: TimelineChange,
        messages: Vec<Message>,
    },
    /// A conversation became the focused one.
    FocusChanged { peer: PeerProfile },
    /// Directory search results for the latest query.
    SearchResults {
        query: String,
        users: Vec<PeerProfile>,
    },
    /// A send failed; the text is kept for a user retry.
    SendFailed {
        client_id: String,
        peer_id: String,
        text: String,
        error_code: String,
    },
    /// Non-fatal problem the UI may surface.
    Notice {
        code: String,
        message: String,
        recoverable: bool,
    },
}
