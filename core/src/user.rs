use crate::auth::{AuthEvent, CredentialPair};
use crate::coordinator::{ApiError, TokenRefreshCoordinator, LOGIN_PATH, REGISTER_PATH};
use crate::http::{ApiRequest, Envelope};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

pub const QUERY_INFO_PATH: &str = "/users/query_info/";
pub const UPDATE_PASSWORD_PATH: &str = "/users/update_password/";
pub const EMAIL_CODE_PATH: &str = "/verify/email_code/";

pub fn profile_path(user_id: i64) -> String {
    format!("/users/{user_id}/")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub gender: Option<i64>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub date_joined: Option<String>,
    #[serde(default)]
    pub last_login: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserInfo {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Editable profile fields; unset fields are left out of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<i64>,
}

/// The server checks `email` was verified through [`UserApi::send_email_code`] first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangePasswordRequest {
    pub email: String,
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// The login answer: the user record plus the freshly minted credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub user: UserInfo,
    pub credentials: CredentialPair,
    pub expires_in: Option<u64>,
}

impl TryFrom<Envelope<UserInfo>> for LoginResponse {
    type Error = ApiError;

    fn try_from(envelope: Envelope<UserInfo>) -> Result<Self, Self::Error> {
        let mut extra = Value::Object(envelope.extra);
        let expires_in = extra
            .get("expires_in")
            .or_else(|| extra.get("expiresIn"))
            .and_then(Value::as_u64);
        let credentials: CredentialPair = serde_json::from_value(extra.take())?;
        Ok(Self {
            user: envelope.data,
            credentials,
            expires_in,
        })
    }
}

/// Account endpoints. Login and logout are the only places, besides a failed refresh,
/// where the credential store changes hands.
#[derive(Clone)]
pub struct UserApi {
    coordinator: TokenRefreshCoordinator,
}

impl UserApi {
    pub fn new(coordinator: TokenRefreshCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let request = ApiRequest::post(
            LOGIN_PATH,
            json!({ "username": username, "password": password }),
        );
        let envelope: Envelope<UserInfo> = self.coordinator.send_json(request).await?;
        let login = LoginResponse::try_from(envelope)?;
        if let Err(err) = self.coordinator.credentials().set_tokens(&login.credentials) {
            warn!(error = ?err, "credentials kept in memory only");
        }
        info!(user = %login.user.username, "signed in");
        self.coordinator.notify(AuthEvent::SignedIn);
        Ok(login)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<UserInfo, ApiError> {
        let body = serde_json::to_value(request)?;
        let envelope: Envelope<UserInfo> = self
            .coordinator
            .send_json(ApiRequest::post(REGISTER_PATH, body))
            .await?;
        Ok(envelope.data)
    }

    pub async fn current_user(&self) -> Result<UserInfo, ApiError> {
        let envelope: Envelope<UserInfo> = self
            .coordinator
            .send_json(ApiRequest::get(QUERY_INFO_PATH))
            .await?;
        Ok(envelope.data)
    }

    pub async fn update_profile(
        &self,
        user_id: i64,
        update: &ProfileUpdate,
    ) -> Result<UserInfo, ApiError> {
        let body = serde_json::to_value(update)?;
        let envelope: Envelope<UserInfo> = self
            .coordinator
            .send_json(ApiRequest::patch(profile_path(user_id), body))
            .await?;
        info!(user = %envelope.data.username, "profile updated");
        Ok(envelope.data)
    }

    /// Change the password. The stored credentials stay valid.
    pub async fn update_password(&self, request: &ChangePasswordRequest) -> Result<(), ApiError> {
        let body = serde_json::to_value(request)?;
        self.coordinator
            .send(ApiRequest::patch(UPDATE_PASSWORD_PATH, body))
            .await?;
        info!("password changed");
        Ok(())
    }

    /// Ask the server to mail a verification link. `change_pwd` allows an address
    /// that already belongs to an account.
    pub async fn send_email_code(
        &self,
        email: &str,
        change_pwd: bool,
    ) -> Result<String, ApiError> {
        let request = ApiRequest::get(EMAIL_CODE_PATH)
            .with_query("email", email)
            .with_query("changePwd", change_pwd);
        let envelope: Envelope<Value> = self.coordinator.send_json(request).await?;
        Ok(envelope.message_text())
    }

    /// Forget the stored credentials. There is no server-side session to end.
    pub fn logout(&self) {
        self.coordinator.credentials().reset();
        info!("signed out");
        self.coordinator.notify(AuthEvent::SignedOut);
    }
}
