//! Network collaborators and the runtime loop for the chat sync engine.
//!
//! [`HttpChatApi`] and [`SocketPushChannel`] implement the capability traits
//! from `chat-core` against the JSON REST endpoints and the push socket.
//! [`spawn_runtime`] wires them to the sync components behind a command and
//! event channel pair.

mod counters;
/// REST collaborator.
pub mod http;
/// Runtime task that owns the sync components.
pub mod runtime;
/// WebSocket push channel with reconnect.
pub mod socket;
/// JSON payload shapes for REST and socket frames.
pub mod wire;

pub use http::HttpChatApi;
pub use runtime::{RuntimeHandle, spawn_runtime};
pub use socket::SocketPushChannel;
