use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

/// Storage for bearer tokens, keyed by service and account.
pub trait CredentialStore: Send + Sync {
    fn store(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialStoreError>;

    fn load(&self, service: &str, account: &str) -> Result<String, CredentialStoreError>;

    fn forget(&self, service: &str, account: &str) -> Result<(), CredentialStoreError>;
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn store(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialStoreError> {
        (**self).store(service, account, token)
    }

    fn load(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        (**self).load(service, account)
    }

    fn forget(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        (**self).forget(service, account)
    }
}

type CredentialMap = HashMap<(String, String), String>;

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    tokens: Arc<RwLock<CredentialMap>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn store(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialStoreError> {
        self.tokens
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?
            .insert((service.to_owned(), account.to_owned()), token.to_owned());
        Ok(())
    }

    fn load(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        self.tokens
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?
            .get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn forget(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        self.tokens
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?
            .remove(&(service.to_owned(), account.to_owned()))
            .map(|_| ())
            .ok_or(CredentialStoreError::NotFound)
    }
}

#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringCredentialStore;

#[cfg(feature = "os-keyring")]
impl OsKeyringCredentialStore {
    fn entry(service: &str, account: &str) -> Result<keyring::Entry, CredentialStoreError> {
        keyring::Entry::new(service, account)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))
    }

    fn map_err(err: keyring::Error) -> CredentialStoreError {
        match err {
            keyring::Error::NoEntry => CredentialStoreError::NotFound,
            keyring::Error::PlatformFailure(inner) | keyring::Error::NoStorageAccess(inner) => {
                CredentialStoreError::Unavailable(inner.to_string())
            }
            other => CredentialStoreError::Backend(other.to_string()),
        }
    }
}

#[cfg(feature = "os-keyring")]
impl CredentialStore for OsKeyringCredentialStore {
    fn store(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialStoreError> {
        Self::entry(service, account)?
            .set_password(token)
            .map_err(Self::map_err)
    }

    fn load(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        Self::entry(service, account)?
            .get_password()
            .map_err(Self::map_err)
    }

    fn forget(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        Self::entry(service, account)?
            .delete_credential()
            .map_err(Self::map_err)
    }
}

/// Supplies the bearer token attached to every REST request.
pub trait AuthTokenProvider: Send + Sync {
    /// Current token, or `None` when nobody is signed in.
    fn bearer_token(&self) -> Option<String>;
}

/// Reads the token for one account from a [`CredentialStore`] on every request.
///
/// A blank stored token counts as signed out.
#[derive(Clone)]
pub struct StoredTokenProvider<S: CredentialStore> {
    store: S,
    service: String,
    account: String,
}

impl<S: CredentialStore> StoredTokenProvider<S> {
    pub fn new(store: S, service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            store,
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn save(&self, token: &str) -> Result<(), CredentialStoreError> {
        self.store.store(&self.service, &self.account, token)
    }

    /// Drop the stored token. A missing token is not an error.
    pub fn clear(&self) -> Result<(), CredentialStoreError> {
        match self.store.forget(&self.service, &self.account) {
            Ok(()) | Err(CredentialStoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl<S: CredentialStore> AuthTokenProvider for StoredTokenProvider<S> {
    fn bearer_token(&self) -> Option<String> {
        match self.store.load(&self.service, &self.account) {
            Ok(token) => Some(token).filter(|token| !token.trim().is_empty()),
            Err(CredentialStoreError::NotFound) => None,
            Err(err) => {
                warn!(account = %self.account, error = %err, "failed to read stored token");
                None
            }
        }
    }
}
