use chrono::{Local, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    #[default]
    Assistant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatModel {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub ep_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSession {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user: Option<i64>,
    #[serde(default, with = "wire_time")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, with = "wire_time")]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub is_active: bool,
}

/// A finalized chat message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "WireMessage")]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: Option<i64>,
    pub role: MessageRole,
    pub reasoning_content: String,
    pub content: String,
    pub model: Option<ChatModel>,
    pub created_at: Option<NaiveDateTime>,
    pub tokens: u64,
    pub parent_message_id: Option<i64>,
    pub resp_id: Option<String>,
}

/// Payload of `message_start`: the message as far as the server knows it, plus the
/// session it belongs to.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "WireMessage")]
pub struct MessageSkeleton {
    pub message: ChatMessage,
    pub session: Option<ChatSession>,
}

/// Fields carried by `message_end`. Present fields override everything accumulated so far.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct MessagePatch {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, with = "wire_time")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default, rename = "message_resp_id")]
    pub resp_id: Option<String>,
    #[serde(default, rename = "parent_message")]
    pub parent_message_id: Option<i64>,
}

impl MessagePatch {
    pub fn apply_to(self, message: &mut ChatMessage) {
        if let Some(id) = self.id {
            message.id = id;
        }
        if let Some(role) = self.role {
            message.role = role;
        }
        if let Some(reasoning) = self.reasoning_content {
            message.reasoning_content = reasoning;
        }
        if let Some(content) = self.content {
            message.content = content;
        }
        if self.created_at.is_some() {
            message.created_at = self.created_at;
        }
        if let Some(tokens) = self.tokens {
            message.tokens = tokens;
        }
        if self.resp_id.is_some() {
            message.resp_id = self.resp_id;
        }
        if self.parent_message_id.is_some() {
            message.parent_message_id = self.parent_message_id;
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    role: MessageRole,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, with = "wire_time")]
    created_at: Option<NaiveDateTime>,
    #[serde(default)]
    tokens: Option<u64>,
    #[serde(default)]
    message_resp_id: Option<String>,
    #[serde(default)]
    session: Option<SessionRef>,
    #[serde(default)]
    model: Option<ChatModel>,
    #[serde(default)]
    parent_message: Option<i64>,
}

/// Sessions arrive either expanded or as a bare id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionRef {
    Id(i64),
    Full(ChatSession),
}

impl From<WireMessage> for MessageSkeleton {
    fn from(wire: WireMessage) -> Self {
        let session = match &wire.session {
            Some(SessionRef::Full(session)) => Some(session.clone()),
            _ => None,
        };
        let session_id = match &wire.session {
            Some(SessionRef::Id(id)) => Some(*id),
            Some(SessionRef::Full(session)) => Some(session.id),
            None => None,
        };
        let message = ChatMessage {
            id: wire.id,
            session_id,
            role: wire.role,
            reasoning_content: wire.reasoning_content.unwrap_or_default(),
            content: wire.content.unwrap_or_default(),
            model: wire.model,
            created_at: wire.created_at,
            tokens: wire.tokens.unwrap_or_default(),
            parent_message_id: wire.parent_message,
            resp_id: wire.message_resp_id,
        };
        Self { message, session }
    }
}

impl From<WireMessage> for ChatMessage {
    fn from(wire: WireMessage) -> Self {
        MessageSkeleton::from(wire).message
    }
}

/// Server timestamps look like `2025-05-01 10:00:00`; anything unparseable reads as absent.
mod wire_time {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.and_then(|text| parse(&text)))
    }

    pub fn parse(text: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(text, FORMAT)
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|time| time.naive_local())
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingPhase {
    Thinking,
    Settled,
}

/// The assistant reply while it is still streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftMessage {
    pub stream_id: Uuid,
    pub phase: ThinkingPhase,
    pub reasoning_content: String,
    pub content: String,
}

impl DraftMessage {
    pub fn begin(stream_id: Uuid, reasoning: Option<String>, content: Option<String>) -> Self {
        Self {
            stream_id,
            phase: ThinkingPhase::Thinking,
            reasoning_content: reasoning.unwrap_or_default(),
            content: content.unwrap_or_default(),
        }
    }

    /// Reasoning takes precedence; a content fragment ends the thinking phase.
    pub fn absorb(&mut self, reasoning: Option<&str>, content: Option<&str>) {
        if let Some(reasoning) = reasoning.filter(|fragment| !fragment.is_empty()) {
            self.reasoning_content.push_str(reasoning);
        } else if let Some(content) = content.filter(|fragment| !fragment.is_empty()) {
            self.content.push_str(content);
            self.phase = ThinkingPhase::Settled;
        }
    }
}

/// Receiver of stream lifecycle events.
pub trait ConversationSink: Send + Sync {
    fn apply_start(&self, skeleton: &MessageSkeleton);
    fn apply_delta(&self, draft: &DraftMessage);
    /// Persist the finalized message. The draft owned by `stream_id` is cleared
    /// without a discard event.
    fn apply_end(&self, stream_id: Uuid, message: ChatMessage);
    /// Drop the draft, but only if it still belongs to `stream_id`.
    fn discard_draft(&self, stream_id: Uuid);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    SessionActivated(i64),
    DraftUpdated(DraftMessage),
    DraftDiscarded(Uuid),
    MessageAdded(ChatMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageView {
    Finalized(ChatMessage),
    Draft(DraftMessage),
}

#[derive(Clone, Default)]
pub struct ConversationState {
    inner: Arc<RwLock<InnerState>>,
    subscribers: Arc<RwLock<Vec<UnboundedSender<ConversationEvent>>>>,
}

#[derive(Default)]
struct InnerState {
    sessions: Vec<ChatSession>,
    active_session: Option<i64>,
    messages: Vec<ChatMessage>,
    draft: Option<DraftMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ConversationEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    fn publish(&self, event: ConversationEvent) {
        self.subscribers
            .write()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn sessions(&self) -> Vec<ChatSession> {
        self.inner.read().sessions.clone()
    }

    pub fn set_sessions(&self, sessions: Vec<ChatSession>) {
        self.inner.write().sessions = sessions;
    }

    /// Insert a session at the top of the list, or update it in place if it is known.
    pub fn upsert_session(&self, session: ChatSession) -> bool {
        upsert_session(&mut self.inner.write(), session)
    }

    pub fn active_session_id(&self) -> Option<i64> {
        self.inner.read().active_session
    }

    pub fn select_session(&self, id: Option<i64>) {
        self.inner.write().active_session = id;
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.read().messages.clone()
    }

    pub fn set_messages(&self, messages: Vec<ChatMessage>) {
        self.inner.write().messages = messages;
    }

    /// Append a message, replacing any earlier copy with the same id.
    pub fn add_message(&self, message: ChatMessage) {
        {
            let mut inner = self.inner.write();
            match inner.messages.iter_mut().find(|known| known.id == message.id) {
                Some(known) => *known = message.clone(),
                None => inner.messages.push(message.clone()),
            }
        }
        self.publish(ConversationEvent::MessageAdded(message));
    }

    pub fn draft(&self) -> Option<DraftMessage> {
        self.inner.read().draft.clone()
    }

    /// Finalized messages followed by the in-progress reply, if any.
    pub fn all_messages(&self) -> Vec<MessageView> {
        let inner = self.inner.read();
        let mut views: Vec<MessageView> = inner
            .messages
            .iter()
            .cloned()
            .map(MessageView::Finalized)
            .collect();
        if let Some(draft) = &inner.draft {
            views.push(MessageView::Draft(draft.clone()));
        }
        views
    }

    pub fn last_assistant_message(&self) -> Option<ChatMessage> {
        self.inner
            .read()
            .messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
            .cloned()
    }

    fn touch_session(inner: &mut InnerState, id: i64) {
        if let Some(session) = inner.sessions.iter_mut().find(|session| session.id == id) {
            session.updated_at = Some(Local::now().naive_local());
        }
    }
}

fn upsert_session(inner: &mut InnerState, session: ChatSession) -> bool {
    match inner.sessions.iter_mut().find(|known| known.id == session.id) {
        Some(known) => {
            *known = session;
            false
        }
        None => {
            inner.sessions.insert(0, session);
            true
        }
    }
}

impl ConversationSink for ConversationState {
    fn apply_start(&self, skeleton: &MessageSkeleton) {
        let Some(session) = &skeleton.session else {
            return;
        };
        let activated = {
            let mut inner = self.inner.write();
            if inner.active_session == Some(session.id) {
                false
            } else {
                upsert_session(&mut inner, session.clone());
                inner.active_session = Some(session.id);
                true
            }
        };
        if activated {
            self.publish(ConversationEvent::SessionActivated(session.id));
        }
    }

    fn apply_delta(&self, draft: &DraftMessage) {
        self.inner.write().draft = Some(draft.clone());
        self.publish(ConversationEvent::DraftUpdated(draft.clone()));
    }

    fn apply_end(&self, stream_id: Uuid, message: ChatMessage) {
        {
            let mut inner = self.inner.write();
            if let Some(session_id) = message.session_id {
                Self::touch_session(&mut inner, session_id);
            }
            if inner
                .draft
                .as_ref()
                .is_some_and(|draft| draft.stream_id == stream_id)
            {
                inner.draft = None;
            }
        }
        self.add_message(message);
    }

    fn discard_draft(&self, stream_id: Uuid) {
        let discarded = {
            let mut inner = self.inner.write();
            match &inner.draft {
                Some(draft) if draft.stream_id == stream_id => {
                    inner.draft = None;
                    true
                }
                _ => false,
            }
        };
        if discarded {
            self.publish(ConversationEvent::DraftDiscarded(stream_id));
        }
    }
}
