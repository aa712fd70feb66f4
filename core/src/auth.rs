use crate::store::{
    CredentialStorage, MemoryCredentialStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Access/refresh pair as minted by the login and refresh endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub is_authenticated: bool,
}

/// Authentication changes that the front end has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    /// The session can no longer be renewed; the user has to log in again.
    LoginRequired { reason: String },
}

impl AuthEvent {
    pub fn user_message(&self) -> String {
        match self {
            Self::SignedIn => "Signed in.".to_string(),
            Self::SignedOut => "Signed out.".to_string(),
            Self::LoginRequired { .. } => {
                "Your session has expired. Please log in again.".to_string()
            }
        }
    }
}

/// In-memory view of the credential pair, written through to durable storage.
#[derive(Clone)]
pub struct CredentialStore {
    state: Arc<RwLock<AuthState>>,
    storage: Arc<dyn CredentialStorage>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        Self {
            state: Arc::new(RwLock::new(AuthState::default())),
            storage,
        }
    }

    /// Rebuild the authentication state from whatever a previous run persisted.
    pub fn restore(storage: Arc<dyn CredentialStorage>) -> Self {
        let access_token = storage.get(ACCESS_TOKEN_KEY);
        let refresh_token = storage.get(REFRESH_TOKEN_KEY);
        let is_authenticated = access_token.is_some() && refresh_token.is_some();
        Self {
            state: Arc::new(RwLock::new(AuthState {
                access_token,
                refresh_token,
                is_authenticated,
            })),
            storage,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStorage::new()))
    }

    pub fn snapshot(&self) -> AuthState {
        self.state.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().is_authenticated
    }

    pub fn access_token(&self) -> Option<String> {
        let cached = self.state.read().access_token.clone();
        cached.or_else(|| self.storage.get(ACCESS_TOKEN_KEY))
    }

    pub fn refresh_token(&self) -> Option<String> {
        let cached = self.state.read().refresh_token.clone();
        cached.or_else(|| self.storage.get(REFRESH_TOKEN_KEY))
    }

    /// Install a new pair. Memory is always updated; the error reports a failed durable write.
    pub fn set_tokens(&self, pair: &CredentialPair) -> Result<()> {
        {
            let mut state = self.state.write();
            state.access_token = Some(pair.access.clone());
            state.refresh_token = Some(pair.refresh.clone());
            state.is_authenticated = true;
        }
        self.storage.set(ACCESS_TOKEN_KEY, &pair.access)?;
        self.storage.set(REFRESH_TOKEN_KEY, &pair.refresh)?;
        Ok(())
    }

    pub fn reset(&self) {
        *self.state.write() = AuthState::default();
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(err) = self.storage.remove(key) {
                warn!(error = ?err, key, "failed to remove stored credential");
            }
        }
    }
}
