use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::ServiceResult;
use crate::models::{Conversation, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Full server-side view of one conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// Partial update applied to a conversation summary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_generated: Option<bool>,
}

/// Backend conversations API, treated as a black box by the engine.
///
/// The engine never writes durable state any other way; which storage sits
/// behind this trait is somebody else's problem.
pub trait ConversationService: Send + Sync + 'static {
    /// List all conversation summaries, most recently updated first.
    fn list(&self) -> BoxFuture<'static, ServiceResult<Vec<Conversation>>>;

    /// Load the full detail for one conversation.
    fn get(&self, id: &str) -> BoxFuture<'static, ServiceResult<ConversationDetail>>;

    /// Create an empty conversation and return its summary.
    fn create(&self) -> BoxFuture<'static, ServiceResult<Conversation>>;

    /// Apply a partial update (rename, title flags).
    fn update(&self, id: &str, patch: ConversationPatch)
    -> BoxFuture<'static, ServiceResult<()>>;

    /// Delete a conversation.
    fn delete(&self, id: &str) -> BoxFuture<'static, ServiceResult<()>>;

    /// Append a finalized message to a conversation.
    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, ServiceResult<()>>;
}
