//! Client-side durable state for the chat runtime.

/// Bearer token storage and providers.
pub mod credentials;
/// Persisted unread badge counters.
pub mod counter;

pub use counter::{CounterStoreError, FileCounterStore, InMemoryCounterStore, UnreadCounterStore};
#[cfg(feature = "os-keyring")]
pub use credentials::OsKeyringCredentialStore;
pub use credentials::{
    AuthTokenProvider, CredentialStore, CredentialStoreError, InMemoryCredentialStore,
    StoredTokenProvider,
};
