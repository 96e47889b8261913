//! Bearer token storage for the console.
//!
//! With the `os-keyring` feature the token survives restarts in the OS
//! keyring; otherwise it lives for the process only.

use std::sync::Arc;

#[cfg(feature = "os-keyring")]
use chat_platform::OsKeyringCredentialStore;
use chat_platform::{
    AuthTokenProvider, CredentialStore, InMemoryCredentialStore, StoredTokenProvider,
};
use tracing::{info, warn};

const KEYRING_SERVICE: &str = "notechat-console";

pub type ConsoleTokens = StoredTokenProvider<Arc<dyn CredentialStore>>;

#[cfg(feature = "os-keyring")]
fn default_store() -> Arc<dyn CredentialStore> {
    Arc::new(OsKeyringCredentialStore)
}

#[cfg(not(feature = "os-keyring"))]
fn default_store() -> Arc<dyn CredentialStore> {
    Arc::new(InMemoryCredentialStore::default())
}

/// Token provider for `user_id`. A token passed in replaces the stored one.
pub fn token_provider(user_id: &str, token: Option<&str>) -> ConsoleTokens {
    with_store(default_store(), user_id, token)
}

pub(crate) fn with_store(
    store: Arc<dyn CredentialStore>,
    user_id: &str,
    token: Option<&str>,
) -> ConsoleTokens {
    let tokens = StoredTokenProvider::new(store, KEYRING_SERVICE, user_id);
    let Some(token) = token else {
        if tokens.bearer_token().is_none() {
            warn!(%user_id, "no bearer token stored; REST calls go out unauthenticated");
        }
        return tokens;
    };
    match tokens.save(token) {
        Ok(()) => tokens,
        Err(err) => {
            warn!(
                %user_id,
                error = %err,
                "credential store rejected the token; keeping it in memory"
            );
            let memory: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::default());
            let fallback = StoredTokenProvider::new(memory, KEYRING_SERVICE, user_id);
            if let Err(err) = fallback.save(token) {
                warn!(%user_id, error = %err, "in-memory token store failed");
            }
            fallback
        }
    }
}

/// Drop the stored token on sign-out.
pub fn forget(tokens: &ConsoleTokens) {
    match tokens.clear() {
        Ok(()) => info!("stored bearer token cleared"),
        Err(err) => warn!(error = %err, "failed to clear stored bearer token"),
    }
}
