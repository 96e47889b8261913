//! Conversation synchronization engine shared by the chat runtime and its front ends.
//!
//! This crate holds the command/event protocol, the session state machine,
//! the timeline pager, the conversation index, send reconciliation and the
//! badge bridge. Nothing here performs I/O; collaborators are injected through
//! the traits in [`collaborators`].

/// Async command/event channel primitives.
pub mod channel;
/// Capability traits for the REST and push collaborators.
pub mod collaborators;
/// Recency-ordered conversation list with unread counts.
pub mod conversations;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Send acknowledgement and history page normalization.
pub mod normalization;
/// Unread badge aggregation and the cross-feature entry point.
pub mod notifications;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Debounced directory search bookkeeping.
pub mod search;
/// Optimistic send reconciliation.
pub mod send;
/// Push connection lifecycle and identity binding.
pub mod session;
/// Paged, deduplicated message timeline.
pub mod timeline;
/// Protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChannelError, ChatChannels, EventStream};
pub use collaborators::{ChatApi, PushChannel};
pub use conversations::{ConversationIndex, IncomingOutcome, SeenWindow};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{
    SendOutcome, detect_history_order, normalize_history, normalize_send_outcome,
    notice_from_error,
};
pub use notifications::{BadgeCounter, NotificationBridge};
pub use retry::{Backoff, RetryPolicy};
pub use search::{SearchDebouncer, SearchTicket};
pub use send::{SendPipeline, SendResolution};
pub use session::{ConnectivityHandler, SessionAction, SessionManager, SessionStateMachine};
pub use timeline::{
    LiveOutcome, PageCursor, PageKind, PageOutcome, PageRequest, TimelineError, TimelinePager,
};
pub use types::{
    ChatCommand, ChatEvent, ConnectivityState, Conversation, DeliveryState, HistoryOrder,
    HistoryPage, LinkState, Message, OutboundMessage, PeerProfile, PushEvent, RuntimeConfig,
    SendAck, TimelineChange,
};
