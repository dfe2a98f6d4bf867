use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TITLE: &str = "New Chat";

/// Summary of a single conversation as shown in the sidebar.
///
/// Owned by the `ConversationStore` and mutated only through its methods;
/// the stream reconciler writes messages, never summaries. Also doubles as
/// the wire DTO, hence the camelCase field names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub title_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            title_generated: false,
            created_at: now,
            updated_at: now,
            message_count: 0,
            first_message: None,
            is_archived: false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conversation_defaults() {
        let conv = Conversation::new("c-1");
        assert_eq!(conv.title, DEFAULT_TITLE);
        assert!(!conv.title_generated);
        assert_eq!(conv.message_count, 0);
        assert!(!conv.is_archived);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let conv = Conversation::new("c-1");
        let json = serde_json::to_value(&conv).unwrap();
        assert!(json.get("titleGenerated").is_some());
        assert!(json.get("messageCount").is_some());
        assert!(json.get("isArchived").is_some());
    }
}
