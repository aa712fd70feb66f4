pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod fake;
pub mod http;
pub mod state;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod user;

pub use auth::{AuthEvent, AuthState, CredentialPair, CredentialStore};
pub use chat::{ChatClient, ChatError, CreateMessageRequest, ThinkType};
pub use client::WoodchatClient;
pub use config::{ClientSettings, ConfigError};
pub use coordinator::{ApiError, RefreshError, TokenRefreshCoordinator};
pub use http::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
pub use state::{
    ChatMessage, ChatSession, ConversationEvent, ConversationSink, ConversationState,
    DraftMessage, MessageRole,
};
pub use store::{CredentialStorage, FileCredentialStorage, MemoryCredentialStorage};
pub use stream::{StreamError, StreamOutcome, StreamReducer};
pub use tokio_util::sync::CancellationToken;
pub use user::{ChangePasswordRequest, ProfileUpdate, UserApi, UserInfo};
pub use uuid::Uuid;
