use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::conversation_service::{
    BoxFuture, ConversationDetail, ConversationPatch, ConversationService,
};
use super::error::{ServiceError, ServiceResult};
use crate::models::{Conversation, Message, MessageRole};

/// In-memory conversations backend.
/// Useful for testing and development; failure injection covers the
/// rollback paths.
#[derive(Clone, Default)]
pub struct InMemoryConversationService {
    inner: Arc<Mutex<Inner>>,
    fail_requests: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
}

impl InMemoryConversationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following request fail with `ServiceError::Unavailable`.
    pub fn set_fail(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::Relaxed);
    }

    /// Insert a conversation with its messages directly, bypassing the API.
    pub fn seed(&self, conversation: Conversation, messages: Vec<Message>) {
        let mut inner = self.inner.lock();
        inner
            .messages
            .insert(conversation.id.clone(), messages);
        inner
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.lock().conversations.get(id).cloned()
    }

    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.inner.lock().messages.get(id).cloned().unwrap_or_default()
    }

    fn check(&self) -> ServiceResult<()> {
        if self.fail_requests.load(Ordering::Relaxed) {
            Err(ServiceError::Unavailable {
                message: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl ConversationService for InMemoryConversationService {
    fn list(&self) -> BoxFuture<'static, ServiceResult<Vec<Conversation>>> {
        let this = self.clone();

        Box::pin(async move {
            this.check()?;
            let inner = this.inner.lock();
            let mut result: Vec<Conversation> = inner.conversations.values().cloned().collect();

            // Sort by updated_at descending
            result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

            Ok(result)
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'static, ServiceResult<ConversationDetail>> {
        let this = self.clone();
        let id = id.to_string();

        Box::pin(async move {
            this.check()?;
            let inner = this.inner.lock();
            let conversation = inner
                .conversations
                .get(&id)
                .cloned()
                .ok_or(ServiceError::NotFound { id: id.clone() })?;
            let messages = inner.messages.get(&id).cloned().unwrap_or_default();

            Ok(ConversationDetail {
                conversation,
                messages,
            })
        })
    }

    fn create(&self) -> BoxFuture<'static, ServiceResult<Conversation>> {
        let this = self.clone();

        Box::pin(async move {
            this.check()?;
            let conversation = Conversation::new(Uuid::new_v4().to_string());
            let mut inner = this.inner.lock();
            inner.messages.insert(conversation.id.clone(), Vec::new());
            inner
                .conversations
                .insert(conversation.id.clone(), conversation.clone());

            Ok(conversation)
        })
    }

    fn update(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, ServiceResult<()>> {
        let this = self.clone();
        let id = id.to_string();

        Box::pin(async move {
            this.check()?;
            let mut inner = this.inner.lock();
            let conversation = inner
                .conversations
                .get_mut(&id)
                .ok_or(ServiceError::NotFound { id: id.clone() })?;

            if let Some(title) = patch.title {
                conversation.title = title;
            }
            if let Some(generated) = patch.title_generated {
                conversation.title_generated = generated;
            }
            conversation.touch();

            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, ServiceResult<()>> {
        let this = self.clone();
        let id = id.to_string();

        Box::pin(async move {
            this.check()?;
            let mut inner = this.inner.lock();
            inner.conversations.remove(&id);
            inner.messages.remove(&id);

            Ok(())
        })
    }

    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, ServiceResult<()>> {
        let this = self.clone();
        let id = conversation_id.to_string();

        Box::pin(async move {
            this.check()?;
            let mut inner = this.inner.lock();
            if !inner.conversations.contains_key(&id) {
                return Err(ServiceError::NotFound { id });
            }

            let messages = inner.messages.entry(id.clone()).or_default();
            messages.push(message.clone());
            let message_count = messages.len();

            if let Some(conversation) = inner.conversations.get_mut(&id) {
                conversation.message_count = message_count;
                if conversation.first_message.is_none() && message.role == MessageRole::User {
                    conversation.first_message = Some(message.content.clone());
                }
                conversation.updated_at = Utc::now();
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let service = InMemoryConversationService::new();

        let created = service.create().await.unwrap();
        let detail = service.get(&created.id).await.unwrap();

        assert_eq!(detail.conversation.id, created.id);
        assert!(detail.messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let service = InMemoryConversationService::new();

        let created = service.create().await.unwrap();
        service.delete(&created.id).await.unwrap();

        assert!(matches!(
            service.get(&created.id).await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_sorted_by_updated_at() {
        let service = InMemoryConversationService::new();

        let mut older = Conversation::new("older");
        older.updated_at = Utc::now() - chrono::Duration::hours(1);
        let newer = Conversation::new("newer");
        service.seed(older, Vec::new());
        service.seed(newer, Vec::new());

        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "newer");
        assert_eq!(listed[1].id, "older");
    }

    #[tokio::test]
    async fn test_append_message_updates_summary() {
        let service = InMemoryConversationService::new();
        let created = service.create().await.unwrap();

        service
            .append_message(&created.id, Message::user("first question"))
            .await
            .unwrap();

        let conversation = service.conversation(&created.id).unwrap();
        assert_eq!(conversation.message_count, 1);
        assert_eq!(
            conversation.first_message.as_deref(),
            Some("first question")
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let service = InMemoryConversationService::new();
        service.set_fail(true);

        assert!(matches!(
            service.list().await,
            Err(ServiceError::Unavailable { .. })
        ));

        service.set_fail(false);
        assert!(service.list().await.is_ok());
    }
}
