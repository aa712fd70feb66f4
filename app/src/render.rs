use std::io::Write;
use woodchat_core::state::{ChatMessage, ChatSession, ConversationEvent, DraftMessage, MessageRole};
use woodchat_core::stream::StreamOutcome;

/// Prints a streaming reply incrementally, writing only what each draft update added.
pub struct DraftPrinter<W: Write> {
    out: W,
    reasoning_len: usize,
    content_len: usize,
}

impl<W: Write> DraftPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            reasoning_len: 0,
            content_len: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle(&mut self, event: &ConversationEvent) -> std::io::Result<()> {
        match event {
            ConversationEvent::DraftUpdated(draft) => self.draft(draft),
            ConversationEvent::DraftDiscarded(_) => self.break_line(),
            ConversationEvent::MessageAdded(message) if message.role == MessageRole::Assistant => {
                self.finish(message)
            }
            _ => Ok(()),
        }
    }

    fn draft(&mut self, draft: &DraftMessage) -> std::io::Result<()> {
        if let Some(added) = draft.reasoning_content.get(self.reasoning_len..) {
            if !added.is_empty() {
                if self.reasoning_len == 0 {
                    write!(self.out, "[thinking] ")?;
                }
                write!(self.out, "{added}")?;
                self.reasoning_len = draft.reasoning_content.len();
            }
        }
        if let Some(added) = draft.content.get(self.content_len..) {
            if !added.is_empty() {
                if self.content_len == 0 && self.reasoning_len > 0 {
                    writeln!(self.out, "\n")?;
                }
                write!(self.out, "{added}")?;
                self.content_len = draft.content.len();
            }
        }
        self.out.flush()
    }

    fn finish(&mut self, message: &ChatMessage) -> std::io::Result<()> {
        if let Some(rest) = message.content.get(self.content_len..) {
            write!(self.out, "{rest}")?;
        }
        self.reset();
        writeln!(self.out)?;
        self.out.flush()
    }

    /// End a partially printed draft so whatever follows starts on its own line.
    fn break_line(&mut self) -> std::io::Result<()> {
        let printed = self.reasoning_len > 0 || self.content_len > 0;
        self.reset();
        if printed {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    fn reset(&mut self) {
        self.reasoning_len = 0;
        self.content_len = 0;
    }
}

/// A stopped reply is a normal outcome; say so instead of failing.
pub fn report_outcome<W: Write>(out: &mut W, outcome: &StreamOutcome) -> std::io::Result<()> {
    match outcome.user_message() {
        Some(notice) => writeln!(out, "{notice}"),
        None => Ok(()),
    }
}

pub fn session_line(session: &ChatSession) -> String {
    let updated = session
        .updated_at
        .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{:>6}  {}  {}", session.id, updated, session.title)
}

pub fn message_block(message: &ChatMessage) -> String {
    let speaker = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    };
    format!("[{speaker}] {}", message.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use woodchat_core::fake::{FakeBackend, ReplyScript, DEMO_PASSWORD, DEMO_USERNAME};
    use woodchat_core::state::ThinkingPhase;
    use woodchat_core::{CreateMessageRequest, CredentialStore, Uuid, WoodchatClient};

    async fn printed_reply(backend: &FakeBackend, content: &str) -> (String, bool) {
        let (client, _events) =
            WoodchatClient::with_parts(Arc::new(backend.clone()), CredentialStore::in_memory());
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        let mut events = client.state().subscribe();
        let outcome = client
            .chat
            .send_message(CreateMessageRequest::new(content, "doubao"))
            .await;

        let mut printer = DraftPrinter::new(Vec::new());
        while let Ok(event) = events.try_recv() {
            printer.handle(&event).expect("write");
        }
        let printed = String::from_utf8(printer.into_inner()).expect("utf8");
        let finalized = matches!(outcome, Ok(StreamOutcome::Finalized(_)));
        (printed, finalized)
    }

    fn draft(reasoning: &str, content: &str) -> ConversationEvent {
        ConversationEvent::DraftUpdated(DraftMessage {
            stream_id: Uuid::nil(),
            phase: if content.is_empty() {
                ThinkingPhase::Thinking
            } else {
                ThinkingPhase::Settled
            },
            reasoning_content: reasoning.into(),
            content: content.into(),
        })
    }

    #[test]
    fn prints_only_new_text() {
        let mut printer = DraftPrinter::new(Vec::new());
        for event in [
            draft("Let me", ""),
            draft("Let me think", ""),
            draft("Let me think", "Hi"),
            draft("Let me think", "Hi there"),
            ConversationEvent::MessageAdded(ChatMessage {
                role: MessageRole::Assistant,
                content: "Hi there".into(),
                ..ChatMessage::default()
            }),
        ] {
            printer.handle(&event).expect("write");
        }
        let printed = String::from_utf8(printer.into_inner()).expect("utf8");
        assert_eq!(printed, "[thinking] Let me think\n\nHi there\n");
    }

    #[tokio::test]
    async fn finalized_reply_prints_only_the_reply() {
        let backend = FakeBackend::new();
        let (printed, finalized) = printed_reply(&backend, "hello").await;
        assert!(finalized);
        assert_eq!(printed, "[thinking] The user said \"hello\".\n\nEcho: hello\n");
    }

    #[tokio::test]
    async fn incomplete_reply_is_not_labelled_by_the_printer() {
        let backend = FakeBackend::new();
        backend.set_reply(ReplyScript::Chunks(vec![
            b"data: {\"type\":\"message_start\",\"data\":{\"id\":-1}}\n\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n".to_vec(),
        ]));
        let (printed, finalized) = printed_reply(&backend, "hello").await;
        assert!(!finalized);
        assert_eq!(printed, "half\n");
    }

    #[test]
    fn only_a_stopped_reply_gets_a_notice() {
        let mut out = Vec::new();
        let finalized = StreamOutcome::Finalized(ChatMessage::default());
        report_outcome(&mut out, &finalized).expect("write");
        assert!(out.is_empty());

        report_outcome(&mut out, &StreamOutcome::Cancelled).expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), "Generation stopped.\n");
    }
}
