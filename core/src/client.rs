use crate::auth::{AuthEvent, CredentialStore};
use crate::chat::ChatClient;
use crate::config::ClientSettings;
use crate::coordinator::TokenRefreshCoordinator;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::state::ConversationState;
use crate::store::FileCredentialStorage;
use crate::user::UserApi;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Everything a front end needs, wired around one shared coordinator.
#[derive(Clone)]
pub struct WoodchatClient {
    pub coordinator: TokenRefreshCoordinator,
    pub users: UserApi,
    pub chat: ChatClient,
}

impl WoodchatClient {
    /// Real network transport with credentials persisted under `storage_root`
    /// (the platform config directory when `None`).
    pub fn connect(
        settings: &ClientSettings,
        storage_root: Option<PathBuf>,
    ) -> Result<(Self, UnboundedReceiver<AuthEvent>)> {
        let transport = ReqwestTransport::new(&settings.base_url, settings.timeout)
            .with_context(|| format!("cannot use base url {}", settings.base_url))?;
        let root = storage_root.unwrap_or_else(FileCredentialStorage::default_root);
        debug!(root = %root.display(), base_url = %settings.base_url, "connecting");
        let credentials = CredentialStore::restore(Arc::new(FileCredentialStorage::new(root)));
        Ok(Self::with_parts(Arc::new(transport), credentials))
    }

    pub fn with_parts(
        transport: Arc<dyn HttpTransport>,
        credentials: CredentialStore,
    ) -> (Self, UnboundedReceiver<AuthEvent>) {
        let (coordinator, events) = TokenRefreshCoordinator::new(transport, credentials);
        let client = Self {
            users: UserApi::new(coordinator.clone()),
            chat: ChatClient::new(coordinator.clone(), ConversationState::new()),
            coordinator,
        };
        (client, events)
    }

    pub fn state(&self) -> &ConversationState {
        self.chat.state()
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.coordinator.credentials()
    }
}
