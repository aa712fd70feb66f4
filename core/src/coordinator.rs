use crate::auth::{AuthEvent, CredentialPair, CredentialStore};
use crate::http::{
    collect_body, payload_message, ApiRequest, ApiResponse, ByteStream, HttpTransport,
    TransportError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LOGIN_PATH: &str = "/users/login/";
pub const REGISTER_PATH: &str = "/users/register/";
pub const REFRESH_PATH: &str = "/users/refresh_token/";

/// Endpoints that are called without a bearer credential.
pub const PUBLIC_PATHS: [&str; 3] = [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH];

pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.iter().any(|public| path.contains(public))
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    #[error("no refresh token is stored")]
    MissingToken,
    #[error("refresh rejected with status {status}: {}", payload_message(.payload))]
    Rejected { status: u16, payload: Value },
    #[error("refresh response was malformed: {0}")]
    Malformed(String),
    #[error("refresh request failed: {0}")]
    Transport(TransportError),
    #[error("refresh was abandoned before it completed")]
    Abandoned,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// A 4xx answer other than an expired credential; the payload is the server's own.
    #[error("request rejected with status {status}: {}", payload_message(.payload))]
    Rejected { status: u16, payload: Value },
    #[error("credential rejected again after renewal: {}", payload_message(.payload))]
    Unauthorized { payload: Value },
    #[error("session expired: {0}")]
    RefreshFailed(#[source] RefreshError),
    #[error("server error {status}: {}", payload_message(.payload))]
    Server { status: u16, payload: Value },
    #[error("network error: {0}")]
    Transport(#[from] TransportError),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { payload, .. } => payload_message(payload),
            Self::Unauthorized { .. } => "You are not allowed to do that.".to_string(),
            Self::RefreshFailed(_) => "Your session has expired. Please log in again.".to_string(),
            Self::Server { status, .. } => {
                format!("The server failed ({status}). Try again later.")
            }
            Self::Transport(err) => format!("Could not reach the server: {err}."),
            Self::Decode(_) => "The server sent an unexpected response.".to_string(),
        }
    }
}

/// A request travelling through the coordinator, remembered so it can be replayed once.
#[derive(Debug, Clone)]
struct PendingRequest {
    id: Uuid,
    request: ApiRequest,
    retried: bool,
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<Waiter>,
}

/// Attaches credentials to outgoing calls and renews them, at most once at a time,
/// when the server reports them expired.
///
/// One instance is created at start-up and shared (it is cheap to clone) for the
/// lifetime of the process.
#[derive(Clone)]
pub struct TokenRefreshCoordinator {
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialStore,
    refresh: Arc<Mutex<RefreshState>>,
    events_tx: UnboundedSender<AuthEvent>,
}

impl TokenRefreshCoordinator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: CredentialStore,
    ) -> (Self, UnboundedReceiver<AuthEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        (
            Self {
                transport,
                credentials,
                refresh: Arc::new(Mutex::new(RefreshState::default())),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh.lock().refreshing
    }

    pub(crate) fn notify(&self, event: AuthEvent) {
        self.events_tx.send(event).ok();
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut pending = self.prepare(request);
        loop {
            let response = self.transport.execute(&pending.request).await?;
            if response.status == 401 && !is_public_path(&pending.request.path) {
                let token = self.renew(&mut pending, response.body).await?;
                pending.request.set_bearer(&token);
                continue;
            }
            return match failure(response.status, &response.body) {
                Some(err) => Err(err),
                None => Ok(response),
            };
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Ok(response.json()?)
    }

    /// Same credential handling as [`send`](Self::send), for endpoints that answer with a
    /// byte stream.
    pub async fn open_stream(&self, request: ApiRequest) -> Result<ByteStream, ApiError> {
        let mut pending = self.prepare(request);
        loop {
            let response = self.transport.open_stream(&pending.request).await?;
            let status = response.status;
            if (200..300).contains(&status) {
                return Ok(response.body);
            }
            let payload = collect_body(response.body).await;
            if status == 401 && !is_public_path(&pending.request.path) {
                let token = self.renew(&mut pending, payload).await?;
                pending.request.set_bearer(&token);
                continue;
            }
            return Err(failure(status, &payload).unwrap_or(ApiError::Server { status, payload }));
        }
    }

    fn prepare(&self, mut request: ApiRequest) -> PendingRequest {
        if is_public_path(&request.path) {
            request.clear_bearer();
        } else if let Some(token) = self.credentials.access_token() {
            request.set_bearer(&token);
        }
        let pending = PendingRequest {
            id: Uuid::new_v4(),
            request,
            retried: false,
        };
        debug!(request_id = %pending.id, path = %pending.request.path, "dispatching request");
        pending
    }

    async fn renew(
        &self,
        pending: &mut PendingRequest,
        payload: Value,
    ) -> Result<String, ApiError> {
        if pending.retried {
            warn!(
                request_id = %pending.id,
                path = %pending.request.path,
                "credential rejected after renewal"
            );
            return Err(ApiError::Unauthorized { payload });
        }
        pending.retried = true;
        let stale = pending.request.bearer().map(str::to_owned);
        self.fresh_token(stale.as_deref())
            .await
            .map_err(ApiError::RefreshFailed)
    }

    /// Hand out an access token newer than `stale`, refreshing only if nobody else is.
    async fn fresh_token(&self, stale: Option<&str>) -> Result<String, RefreshError> {
        let waiter = {
            let mut state = self.refresh.lock();
            if state.refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            } else {
                if let Some(current) = self.credentials.access_token() {
                    if stale != Some(current.as_str()) {
                        return Ok(current);
                    }
                }
                state.refreshing = true;
                None
            }
        };

        match waiter {
            Some(rx) => {
                debug!("waiting for in-flight credential refresh");
                rx.await.unwrap_or(Err(RefreshError::Abandoned))
            }
            None => self.run_refresh().await,
        }
    }

    async fn run_refresh(&self) -> Result<String, RefreshError> {
        let guard = RefreshGuard {
            state: &self.refresh,
            armed: true,
        };
        match self.request_new_pair().await {
            Ok(pair) => {
                if let Err(err) = self.credentials.set_tokens(&pair) {
                    warn!(error = ?err, "failed to persist refreshed credentials");
                }
                let released = guard.release(Ok(pair.access.clone()));
                info!("waiters" = released, "credential pair refreshed");
                Ok(pair.access)
            }
            Err(err) => {
                warn!(error = %err, "credential refresh failed, signing out");
                self.credentials.reset();
                self.notify(AuthEvent::LoginRequired {
                    reason: err.to_string(),
                });
                guard.release(Err(err.clone()));
                Err(err)
            }
        }
    }

    async fn request_new_pair(&self) -> Result<CredentialPair, RefreshError> {
        let refresh = self
            .credentials
            .refresh_token()
            .filter(|token| !token.is_empty())
            .ok_or(RefreshError::MissingToken)?;
        let request = ApiRequest::post(REFRESH_PATH, json!({ "refresh": refresh }));
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(RefreshError::Transport)?;
        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status,
                payload: response.body,
            });
        }
        response
            .json::<CredentialPair>()
            .map_err(|err| RefreshError::Malformed(err.to_string()))
    }
}

/// Clears the refreshing flag even if the refreshing future is dropped mid-flight;
/// waiters left behind then observe [`RefreshError::Abandoned`].
struct RefreshGuard<'a> {
    state: &'a Mutex<RefreshState>,
    armed: bool,
}

impl RefreshGuard<'_> {
    fn release(mut self, outcome: Result<String, RefreshError>) -> usize {
        self.armed = false;
        let waiters = {
            let mut state = self.state.lock();
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };
        let count = waiters.len();
        for waiter in waiters {
            waiter.send(outcome.clone()).ok();
        }
        count
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            state.refreshing = false;
            state.waiters.clear();
        }
    }
}

fn failure(status: u16, payload: &Value) -> Option<ApiError> {
    if (400..500).contains(&status) {
        Some(ApiError::Rejected {
            status,
            payload: payload.clone(),
        })
    } else if status >= 500 {
        Some(ApiError::Server {
            status,
            payload: payload.clone(),
        })
    } else {
        None
    }
}
