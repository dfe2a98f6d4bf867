use anyhow::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::conversation_service::BoxFuture;

/// Kinds of events delivered over one exchange's session.
///
/// The chat kinds (token, tool*, complete, error, promptPreview) drive the
/// reconciler; the remaining kinds report side-effect tools touching other
/// domains and only fan out cache invalidations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Token,
    ToolCall,
    ToolResult,
    Complete,
    Error,
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    WebsiteSaved,
    WebsiteDeleted,
    ThemeSet,
    ScratchpadUpdated,
    ScratchpadCleared,
    PromptPreview,
    ToolStart,
    ToolEnd,
    MemoryCreated,
    MemoryUpdated,
    MemoryDeleted,
}

impl EventKind {
    /// Cache keys dropped when a side-effect tool touched another domain.
    pub fn invalidated_keys(self) -> &'static [&'static str] {
        match self {
            EventKind::NoteCreated | EventKind::NoteUpdated | EventKind::NoteDeleted => &["notes"],
            EventKind::WebsiteSaved | EventKind::WebsiteDeleted => &["websites"],
            EventKind::ScratchpadUpdated | EventKind::ScratchpadCleared => &["scratchpad"],
            EventKind::MemoryCreated | EventKind::MemoryUpdated | EventKind::MemoryDeleted => {
                &["memories"]
            }
            EventKind::ThemeSet => &["theme"],
            _ => &[],
        }
    }
}

/// One opaque event from a response session.
///
/// Payload fields are read defensively; missing or oddly-typed fields are
/// tolerated because the transport makes no schema promises beyond `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl StreamEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
        }
    }

    /// Builder-style payload field, used by transports and tests.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn map_field(&self, key: &str) -> Option<&Map<String, Value>> {
        self.payload.get(key).and_then(Value::as_object)
    }

    pub fn token(text: &str) -> Self {
        Self::new(EventKind::Token).with("text", text)
    }

    pub fn tool_start(name: &str) -> Self {
        Self::new(EventKind::ToolStart).with("name", name)
    }

    pub fn tool_end(name: &str, status: &str) -> Self {
        Self::new(EventKind::ToolEnd)
            .with("name", name)
            .with("status", status)
    }

    pub fn complete() -> Self {
        Self::new(EventKind::Complete)
    }

    pub fn stream_error(message: &str) -> Self {
        Self::new(EventKind::Error).with("message", message)
    }
}

/// Type alias for response event streams.
pub type ResponseStream = BoxStream<'static, Result<StreamEvent>>;

/// Build a response stream from an already-buffered event sequence.
/// Useful for adapters that receive whole exchanges at once, and for tests.
pub fn stream_from_events(events: Vec<StreamEvent>) -> ResponseStream {
    Box::pin(async_stream::stream! {
        for event in events {
            yield Ok(event);
        }
    })
}

/// Opens the event session for an exchange.
///
/// How the events are framed on the wire is the transport's business; the
/// engine only sees the ordered `StreamEvent` sequence.
pub trait StreamService: Send + Sync + 'static {
    fn open_stream(
        &self,
        conversation_id: &str,
        prompt: &str,
    ) -> BoxFuture<'static, Result<ResponseStream>>;
}
