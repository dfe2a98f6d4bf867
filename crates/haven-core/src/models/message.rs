use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Lifecycle of a message within one exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Error,
}

/// Lifecycle of a single tool invocation inside an assistant response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// A structured side-action the assistant invoked mid-response.
///
/// Tool calls are tracked with their own lifecycle, independent of the text
/// stream, and are unique by id within a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters: Map::new(),
            status: ToolCallStatus::Pending,
            result: None,
        }
    }

    /// Merge a result event into an already-recorded call.
    ///
    /// Result events may omit parameters that arrived with the original call
    /// event, and a populated result is never downgraded to absent.
    pub fn merge_result(&mut self, incoming: ToolCall) {
        if !incoming.name.is_empty() {
            self.name = incoming.name;
        }
        if !incoming.parameters.is_empty() {
            self.parameters = incoming.parameters;
        }
        if incoming.result.is_some() {
            self.result = incoming.result;
        }
        self.status = incoming.status;
    }
}

/// Status of the transient tool banner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveToolStatus {
    Running,
    Success,
    Error,
}

/// Transient banner state for the tool currently (or most recently) running.
/// Not persisted; cleared by an explicit event or by auto-expiry.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveTool {
    pub name: String,
    pub status: ActiveToolStatus,
    pub started_at: DateTime<Utc>,
}

/// A single chat message.
///
/// Ids are generated client-side before any server round-trip so optimistic
/// messages can be reconciled against later server views. Timestamps are
/// carried as RFC 3339 strings because server precision is coarse and must
/// not be trusted for ordering; see `parsed_timestamp`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Tri-state separator marker: `None` = untouched, `Some(true)` = the
    /// next appended token needs a paragraph break, `Some(false)` = handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_newline: Option<bool>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Create a completed user message from submitted text.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Complete,
            tool_calls: Vec::new(),
            needs_newline: None,
            timestamp: Utc::now().to_rfc3339(),
            error: None,
        }
    }

    /// Create the empty assistant placeholder that will receive stream events.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            tool_calls: Vec::new(),
            needs_newline: None,
            timestamp: Utc::now().to_rfc3339(),
            error: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    /// Parse the carried timestamp, tolerating unparsable server values.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Insert or replace a tool call by id, keeping the original position.
    pub fn upsert_tool_call(&mut self, call: ToolCall) {
        if let Some(existing) = self.tool_calls.iter_mut().find(|c| c.id == call.id) {
            *existing = call;
        } else {
            self.tool_calls.push(call);
        }
    }

    /// Merge a tool result by id, inserting the call if it was never seen.
    pub fn merge_tool_result(&mut self, incoming: ToolCall) {
        if let Some(existing) = self.tool_calls.iter_mut().find(|c| c.id == incoming.id) {
            existing.merge_result(incoming);
        } else {
            self.tool_calls.push(incoming);
        }
    }
}
