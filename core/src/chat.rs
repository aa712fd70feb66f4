use crate::coordinator::{ApiError, TokenRefreshCoordinator};
use crate::http::{ApiRequest, Envelope};
use crate::state::{
    ChatMessage, ChatSession, ConversationSink, ConversationState, MessageSkeleton,
};
use crate::stream::{StreamError, StreamOutcome, StreamReducer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SESSION_PATH: &str = "/chat/session/";
pub const MESSAGE_PATH: &str = "/chat/message/";
pub const AI_RESPONSE_PATH: &str = "/chat/message/ai-response/";

/// Whether the model should reason before answering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ThinkType {
    Disabled,
    #[default]
    Enabled,
    Auto,
}

impl From<ThinkType> for u8 {
    fn from(value: ThinkType) -> Self {
        match value {
            ThinkType::Disabled => 0,
            ThinkType::Enabled => 1,
            ThinkType::Auto => 2,
        }
    }
}

impl TryFrom<u8> for ThinkType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Enabled),
            2 => Ok(Self::Auto),
            other => Err(format!("unknown think type {other}")),
        }
    }
}

impl std::str::FromStr for ThinkType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "disabled" | "off" | "0" => Ok(Self::Disabled),
            "enabled" | "on" | "1" => Ok(Self::Enabled),
            "auto" | "2" => Ok(Self::Auto),
            other => Err(format!("unknown think type `{other}`")),
        }
    }
}

/// Body of `POST /chat/message/`; the same fields are echoed to the AI-response endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<i64>,
    pub model_id: String,
    pub think_type: ThinkType,
}

impl CreateMessageRequest {
    pub fn new(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            session_id: None,
            parent_message_id: None,
            model_id: model_id.into(),
            think_type: ThinkType::default(),
        }
    }

    pub fn in_session(mut self, session_id: Option<i64>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn replying_to(mut self, parent_message_id: Option<i64>) -> Self {
        self.parent_message_id = parent_message_id;
        self
    }

    pub fn with_think_type(mut self, think_type: ThinkType) -> Self {
        self.think_type = think_type;
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ChatError {
    #[error("message content is empty")]
    EmptyContent,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ChatError {
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyContent => "Type a message first.".to_string(),
            Self::Api(err) => err.user_message(),
            Self::Stream(err) => err.user_message(),
        }
    }
}

struct ActiveStream {
    id: Uuid,
    cancel: CancellationToken,
}

/// Chat endpoints, with at most one reply streaming at a time.
#[derive(Clone)]
pub struct ChatClient {
    coordinator: TokenRefreshCoordinator,
    state: ConversationState,
    active: Arc<Mutex<Option<ActiveStream>>>,
}

impl ChatClient {
    pub fn new(coordinator: TokenRefreshCoordinator, state: ConversationState) -> Self {
        Self {
            coordinator,
            state,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Reload the session list.
    pub async fn sessions(&self) -> Result<Vec<ChatSession>, ChatError> {
        let envelope: Envelope<Vec<ChatSession>> = self
            .coordinator
            .send_json(ApiRequest::get(SESSION_PATH))
            .await?;
        self.state.set_sessions(envelope.data.clone());
        Ok(envelope.data)
    }

    /// Load one session's history and make it the active session.
    pub async fn messages(&self, session_id: i64) -> Result<Vec<ChatMessage>, ChatError> {
        let request = ApiRequest::get(MESSAGE_PATH).with_query("session_id", session_id);
        let envelope: Envelope<Vec<ChatMessage>> = self.coordinator.send_json(request).await?;
        self.state.select_session(Some(session_id));
        self.state.set_messages(envelope.data.clone());
        Ok(envelope.data)
    }

    /// Post a user message and stream the assistant's reply into the conversation state.
    ///
    /// A reply that is still streaming is cancelled first. The returned outcome is
    /// [`StreamOutcome::Cancelled`] if [`cancel_current`](Self::cancel_current) or a
    /// later `send_message` stopped this one.
    pub async fn send_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<StreamOutcome, ChatError> {
        if request.content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let stream_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.preempt(ActiveStream {
            id: stream_id,
            cancel: cancel.clone(),
        });

        let result = self.exchange(request, stream_id, &cancel).await;
        self.release(stream_id);
        result
    }

    async fn exchange(
        &self,
        request: CreateMessageRequest,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, ChatError> {
        let body = serde_json::to_value(&request).map_err(ApiError::from)?;
        let created: Envelope<MessageSkeleton> = self
            .coordinator
            .send_json(ApiRequest::post(MESSAGE_PATH, body.clone()))
            .await?;
        let MessageSkeleton {
            message: user_message,
            session,
        } = created.data;
        debug!(message_id = user_message.id, "user message created");
        if let Some(session) = session {
            let session_id = session.id;
            self.state.upsert_session(session);
            self.state.select_session(Some(session_id));
        }
        self.state.add_message(user_message.clone());

        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }
        let mut reply = body;
        reply["user_message_id"] = user_message.id.into();
        let reply = ApiRequest::post(AI_RESPONSE_PATH, reply);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            opened = self.coordinator.open_stream(reply) => opened?,
        };

        let sink: &dyn ConversationSink = &self.state;
        let outcome = StreamReducer::with_stream_id(sink, stream_id)
            .run(opened, cancel)
            .await?;
        if let StreamOutcome::Finalized(message) = &outcome {
            info!(message_id = message.id, tokens = message.tokens, "assistant reply finalized");
        }
        Ok(outcome)
    }

    /// Stop the reply that is streaming, if any.
    pub fn cancel_current(&self) -> bool {
        let active = self.active.lock().take();
        match active {
            Some(active) => {
                active.cancel.cancel();
                self.state.discard_draft(active.id);
                true
            }
            None => false,
        }
    }

    fn preempt(&self, next: ActiveStream) {
        let previous = self.active.lock().replace(next);
        if let Some(previous) = previous {
            warn!(stream_id = %previous.id, "preempting reply still in flight");
            previous.cancel.cancel();
            self.state.discard_draft(previous.id);
        }
    }

    fn release(&self, stream_id: Uuid) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|current| current.id == stream_id) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialStore;
    use crate::fake::{FakeBackend, ReplyScript};
    use crate::state::MessageRole;
    use serde_json::json;
    use std::time::Duration;

    fn client(backend: &FakeBackend) -> ChatClient {
        let credentials = CredentialStore::in_memory();
        credentials
            .set_tokens(&backend.issue_credentials())
            .expect("tokens");
        let (coordinator, _events) =
            TokenRefreshCoordinator::new(Arc::new(backend.clone()), credentials);
        ChatClient::new(coordinator, ConversationState::new())
    }

    #[test]
    fn request_serializes_snake_case_fields() {
        let request = CreateMessageRequest::new("hi", "doubao")
            .in_session(Some(4))
            .with_think_type(ThinkType::Auto);
        let value = serde_json::to_value(&request).expect("json");
        assert_eq!(
            value,
            json!({"content": "hi", "session_id": 4, "model_id": "doubao", "think_type": 2})
        );
        assert_eq!("off".parse::<ThinkType>(), Ok(ThinkType::Disabled));
    }

    #[tokio::test]
    async fn send_message_streams_reply_into_state() {
        let backend = FakeBackend::new();
        let chat = client(&backend);

        let outcome = chat
            .send_message(CreateMessageRequest::new("hello", "doubao"))
            .await
            .expect("reply");

        let StreamOutcome::Finalized(reply) = outcome else {
            panic!("expected a finalized reply");
        };
        assert_eq!(reply.content, "Echo: hello");
        assert!(reply.reasoning_content.contains("hello"));
        assert!(reply.id > 0);

        let messages = chat.state().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1], reply);
        assert_eq!(chat.state().draft(), None);
        assert_eq!(chat.state().active_session_id(), reply.session_id);
        assert_eq!(chat.state().sessions().len(), 1);
        assert!(!chat.is_streaming());

        let ask = backend
            .requests()
            .into_iter()
            .find(|request| request.path == AI_RESPONSE_PATH)
            .expect("ai-response request");
        let body = ask.body.expect("body");
        assert_eq!(body["user_message_id"], messages[0].id);
        assert_eq!(body["content"], "hello");
    }

    #[tokio::test]
    async fn empty_content_is_refused_locally() {
        let backend = FakeBackend::new();
        let chat = client(&backend);
        let err = chat
            .send_message(CreateMessageRequest::new("   ", "doubao"))
            .await
            .expect_err("empty");
        assert!(matches!(err, ChatError::EmptyContent));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn cancel_current_stops_a_hanging_reply() {
        let backend = FakeBackend::new();
        backend.set_reply(ReplyScript::ChunksThenHang(vec![
            br#"data: {"type":"message_start","data":{"id":-1,"role":"assistant"}}

data: {"choices":[{"delta":{"content":"partial"}}]}

"#
            .to_vec(),
        ]));
        let chat = client(&backend);

        let sending = chat.send_message(CreateMessageRequest::new("hi", "doubao"));
        let cancelling = async {
            while chat.state().draft().is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(chat.is_streaming());
            assert!(chat.cancel_current());
        };
        let (outcome, ()) = tokio::join!(sending, cancelling);

        assert_eq!(outcome.expect("outcome"), StreamOutcome::Cancelled);
        assert_eq!(chat.state().draft(), None);
        assert_eq!(chat.state().messages().len(), 1);
        assert!(!chat.is_streaming());
        assert!(!chat.cancel_current());
    }

    #[tokio::test]
    async fn history_selects_the_session() {
        let backend = FakeBackend::new();
        let chat = client(&backend);
        chat.send_message(CreateMessageRequest::new("first", "doubao"))
            .await
            .expect("reply");
        let session_id = chat.state().active_session_id().expect("session");

        let reloaded = ChatClient::new(chat.coordinator.clone(), ConversationState::new());
        let sessions = reloaded.sessions().await.expect("sessions");
        assert_eq!(sessions[0].id, session_id);
        let history = reloaded.messages(session_id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(reloaded.state().active_session_id(), Some(session_id));
        assert_eq!(
            reloaded.state().last_assistant_message().map(|m| m.content),
            Some("Echo: first".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_session_surfaces_server_message() {
        let backend = FakeBackend::new();
        let chat = client(&backend);
        let err = chat
            .send_message(CreateMessageRequest::new("hi", "doubao").in_session(Some(99)))
            .await
            .expect_err("missing session");
        assert_eq!(err.user_message(), "当前会话不存在或无权限访问");
        assert!(!chat.is_streaming());
    }
}
