//! Folding of the `text/event-stream` AI reply into conversation state.
//!
//! Bytes are decoded statefully into frames (`data: <json>` units separated by a
//! blank line), each frame is parsed into a [`StreamEvent`], and the events drive
//! a [`StreamReducer`] that keeps the draft reply and hands the finalized message
//! to a [`ConversationSink`].

use crate::http::TransportError;
use crate::state::{ChatMessage, ConversationSink, DraftMessage, MessagePatch, MessageSkeleton};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub const DATA_PREFIX: &str = "data:";
const FRAME_DELIMITER: &str = "\n\n";

/// Incremental UTF-8 decoder and frame splitter.
///
/// Multi-byte characters split across chunks are held back until complete, and a
/// frame split across chunks is buffered until its delimiter arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    undecoded: Vec<u8>,
    text: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode(chunk);
        self.drain_frames()
    }

    /// Flush at end of input: incomplete bytes decode as U+FFFD and any trailing
    /// text without a delimiter becomes a last frame.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.undecoded.is_empty() {
            let rest = std::mem::take(&mut self.undecoded);
            self.text.push_str(&String::from_utf8_lossy(&rest));
        }
        let mut frames = self.drain_frames();
        let rest = std::mem::take(&mut self.text);
        if !rest.trim().is_empty() {
            frames.push(rest);
        }
        frames
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.undecoded.extend_from_slice(chunk);
        let mut consumed = 0;
        while consumed < self.undecoded.len() {
            match std::str::from_utf8(&self.undecoded[consumed..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    consumed = self.undecoded.len();
                }
                Err(err) => {
                    let valid_end = consumed + err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.undecoded[consumed..valid_end]));
                    match err.error_len() {
                        Some(invalid) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_end + invalid;
                        }
                        None => {
                            consumed = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.undecoded.drain(..consumed);
        if self.text.contains("\r\n") {
            self.text = self.text.replace("\r\n", "\n");
        }
    }

    fn drain_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(end) = self.text.find(FRAME_DELIMITER) {
            let frame: String = self.text.drain(..end + FRAME_DELIMITER.len()).collect();
            let frame = frame[..end].trim_start_matches('\n');
            if !frame.trim().is_empty() {
                frames.push(frame.to_string());
            }
        }
        frames
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        message: MessageSkeleton,
    },
    Delta {
        reasoning_fragment: Option<String>,
        content_fragment: Option<String>,
    },
    End {
        final_fields: MessagePatch,
    },
    /// The server gave up generating and said why.
    Failure {
        message: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
}

#[derive(Deserialize)]
struct TypedFrame<T> {
    data: T,
}

#[derive(Deserialize)]
struct DeltaFrame {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
}

#[derive(Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: DeltaBody,
}

#[derive(Default, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Parse one frame. Returns `None` for frames that do not carry a `data:` field.
pub fn parse_frame(frame: &str) -> Option<Result<StreamEvent, FrameError>> {
    let payload = frame.strip_prefix(DATA_PREFIX)?.trim();
    Some(decode_event(payload))
}

fn decode_event(payload: &str) -> Result<StreamEvent, FrameError> {
    let record: Value = serde_json::from_str(payload)?;
    match record.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            let frame: TypedFrame<MessageSkeleton> = serde_json::from_value(record)?;
            Ok(StreamEvent::Start {
                message: frame.data,
            })
        }
        Some("message_end") => {
            let frame: TypedFrame<MessagePatch> = serde_json::from_value(record)?;
            Ok(StreamEvent::End {
                final_fields: frame.data,
            })
        }
        Some(other) => Err(FrameError::UnknownType(other.to_string())),
        None => {
            if let Some(error) = record.get("error") {
                let message = error
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| error.to_string());
                return Ok(StreamEvent::Failure { message });
            }
            let frame: DeltaFrame = serde_json::from_value(record)?;
            let delta = frame
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.delta)
                .unwrap_or_default();
            Ok(StreamEvent::Delta {
                reasoning_fragment: delta.reasoning_content.filter(|text| !text.is_empty()),
                content_fragment: delta.content.filter(|text| !text.is_empty()),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Finalized(ChatMessage),
    /// The user stopped the reply; nothing was persisted.
    Cancelled,
}

impl StreamOutcome {
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Finalized(_) => None,
            Self::Cancelled => Some("Generation stopped.".to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("reply stream ended before the message was complete")]
    Incomplete { server_error: Option<String> },
    #[error("reply stream broke off: {0}")]
    Transport(#[from] TransportError),
}

impl StreamError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Incomplete {
                server_error: Some(reason),
            } => format!("The reply was cut short: {reason}"),
            Self::Incomplete { server_error: None } => {
                "The reply was cut short. Please try again.".to_string()
            }
            Self::Transport(err) => format!("Connection lost while receiving the reply: {err}."),
        }
    }
}

/// Per-stream state: the skeleton from `message_start` and the draft built from deltas.
pub struct StreamReducer<'a> {
    sink: &'a dyn ConversationSink,
    stream_id: Uuid,
    skeleton: Option<ChatMessage>,
    draft: Option<DraftMessage>,
    last_failure: Option<String>,
}

impl<'a> StreamReducer<'a> {
    pub fn new(sink: &'a dyn ConversationSink) -> Self {
        Self::with_stream_id(sink, Uuid::new_v4())
    }

    pub fn with_stream_id(sink: &'a dyn ConversationSink, stream_id: Uuid) -> Self {
        Self {
            sink,
            stream_id,
            skeleton: None,
            draft: None,
            last_failure: None,
        }
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn draft(&self) -> Option<&DraftMessage> {
        self.draft.as_ref()
    }

    /// Read `body` to completion, cancellation, or failure.
    pub async fn run<B>(
        mut self,
        mut body: B,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, StreamError>
    where
        B: Stream<Item = Result<Bytes, TransportError>> + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled());
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled()),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.push(&chunk) {
                        if let Some(message) = self.apply_frame(&frame) {
                            return Ok(StreamOutcome::Finalized(message));
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(stream_id = %self.stream_id, error = %err, "reply stream failed");
                    self.abandon();
                    return Err(err.into());
                }
                None => {
                    for frame in decoder.finish() {
                        if let Some(message) = self.apply_frame(&frame) {
                            return Ok(StreamOutcome::Finalized(message));
                        }
                    }
                    warn!(stream_id = %self.stream_id, "reply stream closed without message_end");
                    self.abandon();
                    return Err(StreamError::Incomplete {
                        server_error: self.last_failure.take(),
                    });
                }
            }
        }
    }

    fn apply_frame(&mut self, frame: &str) -> Option<ChatMessage> {
        match parse_frame(frame) {
            None => {
                trace!(stream_id = %self.stream_id, "ignoring non-data frame");
                None
            }
            Some(Err(err)) => {
                warn!(stream_id = %self.stream_id, error = %err, "skipping malformed frame");
                None
            }
            Some(Ok(event)) => self.apply(event),
        }
    }

    /// Apply one event; returns the finalized message once `message_end` is seen.
    pub fn apply(&mut self, event: StreamEvent) -> Option<ChatMessage> {
        match event {
            StreamEvent::Start { message } => {
                if self.skeleton.is_some() {
                    warn!(stream_id = %self.stream_id, "second message_start, replacing skeleton");
                }
                self.sink.apply_start(&message);
                self.skeleton = Some(message.message);
                None
            }
            StreamEvent::Delta {
                reasoning_fragment,
                content_fragment,
            } => {
                match self.draft.as_mut() {
                    Some(draft) => {
                        draft.absorb(reasoning_fragment.as_deref(), content_fragment.as_deref())
                    }
                    None => {
                        self.draft = Some(DraftMessage::begin(
                            self.stream_id,
                            reasoning_fragment,
                            content_fragment,
                        ))
                    }
                }
                if let Some(draft) = &self.draft {
                    self.sink.apply_delta(draft);
                }
                None
            }
            StreamEvent::End { final_fields } => {
                let Some(mut message) = self.skeleton.take() else {
                    warn!(
                        stream_id = %self.stream_id,
                        "message_end without message_start, skipping"
                    );
                    return None;
                };
                if let Some(draft) = self.draft.take() {
                    message.reasoning_content = draft.reasoning_content;
                    message.content = draft.content;
                }
                final_fields.apply_to(&mut message);
                debug!(stream_id = %self.stream_id, message_id = message.id, "reply finalized");
                self.sink.apply_end(self.stream_id, message.clone());
                Some(message)
            }
            StreamEvent::Failure { message } => {
                warn!(
                    stream_id = %self.stream_id,
                    reason = %message,
                    "server reported a generation failure"
                );
                self.last_failure = Some(message);
                None
            }
        }
    }

    fn cancelled(&mut self) -> StreamOutcome {
        info!(stream_id = %self.stream_id, "reply stream cancelled");
        self.abandon();
        StreamOutcome::Cancelled
    }

    fn abandon(&mut self) {
        self.draft = None;
        self.sink.discard_draft(self.stream_id);
    }
}
