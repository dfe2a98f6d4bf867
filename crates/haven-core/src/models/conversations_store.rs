use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use super::conversation::Conversation;
use super::message::{Message, MessageRole, MessageStatus};
use super::stream_reconciler::StreamTarget;

/// Fingerprint of the last published message list, compared by last-message
/// identity + content + status. Purely a republish shortcut; nothing may rely
/// on it for correctness.
#[derive(Clone, Debug, PartialEq)]
struct PublishMark {
    conversation_id: String,
    last_message: Option<(String, String, MessageStatus)>,
}

/// Authoritative cache of conversation summaries and message detail.
///
/// The store is plain mutable state owned by the controller task. Fetches run
/// as spawned tasks; their results come back through `apply_summaries` /
/// `apply_detail`, and every mutation of message state flows through
/// `update_conversation_messages`. No component writes around the store.
pub struct ConversationStore {
    summaries: Vec<Conversation>,
    summaries_fetched_at: Option<Instant>,
    summary_ttl: Duration,
    messages: HashMap<String, Vec<Message>>,
    active_id: Option<String>,
    loading: bool,
    last_publish: Option<PublishMark>,
}

impl ConversationStore {
    pub fn new(summary_ttl: Duration) -> Self {
        Self {
            summaries: Vec::new(),
            summaries_fetched_at: None,
            summary_ttl,
            messages: HashMap::new(),
            active_id: None,
            loading: false,
            last_publish: None,
        }
    }

    /// Whether the cached summary list can be served without a fetch.
    pub fn summaries_fresh(&self) -> bool {
        self.summaries_fetched_at
            .is_some_and(|at| at.elapsed() < self.summary_ttl)
    }

    pub fn summaries(&self) -> &[Conversation] {
        &self.summaries
    }

    pub fn summary(&self, id: &str) -> Option<&Conversation> {
        self.summaries.iter().find(|c| c.id == id)
    }

    /// Replace the summary cache with a fresh server list.
    /// Archived conversations never enter the cache.
    pub fn apply_summaries(&mut self, list: Vec<Conversation>) {
        self.summaries = list.into_iter().filter(|c| !c.is_archived).collect();
        self.sort_summaries();
        self.summaries_fetched_at = Some(Instant::now());
    }

    /// Force the next non-forced load to hit the network.
    pub fn invalidate_summaries(&mut self) {
        self.summaries_fetched_at = None;
    }

    /// Insert or replace a single summary (optimistic creation, rollback).
    pub fn insert_summary(&mut self, conversation: Conversation) {
        self.summaries.retain(|c| c.id != conversation.id);
        self.summaries.push(conversation);
        self.sort_summaries();
    }

    /// Remove a summary, returning it for a possible rollback.
    pub fn remove_summary(&mut self, id: &str) -> Option<Conversation> {
        let index = self.summaries.iter().position(|c| c.id == id)?;
        Some(self.summaries.remove(index))
    }

    /// Set a conversation's title and generated flag, returning the previous
    /// pair so an optimistic rename can be rolled back.
    pub fn apply_title(
        &mut self,
        id: &str,
        title: String,
        title_generated: bool,
    ) -> Option<(String, bool)> {
        let conversation = self.summaries.iter_mut().find(|c| c.id == id)?;
        let previous = (
            std::mem::replace(&mut conversation.title, title),
            std::mem::replace(&mut conversation.title_generated, title_generated),
        );
        conversation.touch();
        Some(previous)
    }

    pub fn set_active(&mut self, id: Option<String>) {
        self.active_id = id;
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn mark_loading(&mut self, loading: bool, silent: bool) {
        if !silent {
            self.loading = loading;
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn messages(&self, id: &str) -> Option<&[Message]> {
        self.messages.get(id).map(Vec::as_slice)
    }

    /// Remove a conversation's detail, returning it for a possible rollback.
    pub fn take_messages(&mut self, id: &str) -> Vec<Message> {
        self.messages.remove(id).unwrap_or_default()
    }

    /// Put detail back verbatim (delete rollback). No summary bookkeeping.
    pub fn restore_messages(&mut self, id: &str, messages: Vec<Message>) {
        self.messages.insert(id.to_string(), messages);
    }

    /// Store a freshly fetched server view, reconciled against a live stream.
    pub fn apply_detail(
        &mut self,
        id: &str,
        server_messages: Vec<Message>,
        streaming: Option<&StreamTarget>,
    ) {
        let mut merged = self.reconcile_messages(server_messages, id, streaming);
        Self::normalize_messages(&mut merged);
        self.messages.insert(id.to_string(), merged);
    }

    /// If `conversation_id` has a live streaming exchange whose message is
    /// absent from the server view (expected, since the server has not stored
    /// it yet), append the locally held partial message so a background
    /// refresh can never visually erase in-progress output.
    pub fn reconcile_messages(
        &self,
        mut server_messages: Vec<Message>,
        conversation_id: &str,
        streaming: Option<&StreamTarget>,
    ) -> Vec<Message> {
        if let Some(target) = streaming
            && target.conversation_id == conversation_id
            && !server_messages.iter().any(|m| m.id == target.message_id)
            && let Some(live) = self
                .messages
                .get(conversation_id)
                .and_then(|msgs| msgs.iter().find(|m| m.id == target.message_id))
        {
            debug!(
                conv_id = %conversation_id,
                message_id = %target.message_id,
                "server view missing live streaming message, appending local copy"
            );
            server_messages.push(live.clone());
        }
        server_messages
    }

    /// Two-tier write. `persist = false` (every token) only updates the
    /// in-memory view; `persist = true` (message boundaries) also updates the
    /// durable summary fields.
    pub fn update_conversation_messages(
        &mut self,
        id: &str,
        messages: Vec<Message>,
        persist: bool,
    ) {
        if persist {
            if let Some(summary) = self.summaries.iter_mut().find(|c| c.id == id) {
                summary.message_count = messages.len();
                if summary.first_message.is_none() {
                    summary.first_message = messages
                        .iter()
                        .find(|m| m.role == MessageRole::User)
                        .map(|m| m.content.clone());
                }
                summary.updated_at = Utc::now();
            }
            self.sort_summaries();
        }
        self.messages.insert(id.to_string(), messages);
    }

    /// Stable sort by parsed timestamp. Equal or unparsable timestamps keep
    /// their insertion order; server timestamps can be coarse and must not
    /// cause visible reordering within a session.
    pub fn normalize_messages(messages: &mut [Message]) {
        messages.sort_by(|a, b| match (a.parsed_timestamp(), b.parsed_timestamp()) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            _ => std::cmp::Ordering::Equal,
        });
    }

    /// Republish shortcut: false when the list ends in the same (id, content,
    /// status) as the previous publish for the same conversation.
    pub fn should_publish(&mut self, conversation_id: &str, messages: &[Message]) -> bool {
        let mark = PublishMark {
            conversation_id: conversation_id.to_string(),
            last_message: messages
                .last()
                .map(|m| (m.id.clone(), m.content.clone(), m.status)),
        };
        if self.last_publish.as_ref() == Some(&mark) {
            return false;
        }
        self.last_publish = Some(mark);
        true
    }

    fn sort_summaries(&mut self) {
        self.summaries
            .sort_by_key(|c| std::cmp::Reverse(c.updated_at));
    }
}
