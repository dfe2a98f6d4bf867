use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::KeyedCache;
use crate::config::EngineConfig;
use crate::models::conversation::Conversation;
use crate::models::conversations_store::ConversationStore;
use crate::models::message::{ActiveTool, Message, MessageStatus};
use crate::models::notifications::{Notification, NotificationSink};
use crate::models::stream_reconciler::{Effect, StreamReconciler};
use crate::services::conversation_service::{ConversationDetail, ConversationPatch, ConversationService};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::event_stream::{EventKind, StreamEvent, StreamService};
use crate::services::title_generator::{GeneratedTitle, TitleGenerator, clean_title};

/// Cooperative cancellation flag handed to spawned stream tasks.
///
/// Every asynchronous operation that can outlive a user decision gets one of
/// these; the owning task flips it and the worker checks it between awaits.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Commands accepted by the controller.
#[derive(Clone, Debug)]
pub enum ChatCommand {
    SendMessage(String),
    NewConversation,
    SelectConversation(String),
    StopStream,
    RenameConversation { id: String, title: String },
    DeleteConversation(String),
    Refresh { force: bool },
    Shutdown,
}

/// Read-only snapshot published after every state change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatState {
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<String>,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub active_tool: Option<ActiveTool>,
    pub prompt_preview: Option<String>,
    pub error: Option<String>,
    pub loading: bool,
    /// Background refresh has failed repeatedly; data may be stale.
    pub refresh_degraded: bool,
}

/// Results reported back into the owning task by spawned work.
enum Internal {
    SummariesLoaded {
        result: ServiceResult<Vec<Conversation>>,
        silent: bool,
    },
    DetailLoaded {
        conversation_id: String,
        result: ServiceResult<ConversationDetail>,
        silent: bool,
    },
    ConversationCreated {
        result: ServiceResult<Conversation>,
        pending_text: Option<String>,
    },
    StreamEvent {
        conversation_id: String,
        event: StreamEvent,
    },
    StreamFailed {
        conversation_id: String,
        error: String,
    },
    StreamClosed {
        conversation_id: String,
    },
    BannerExpired {
        name: String,
        epoch: u64,
    },
    TitleGenerated {
        conversation_id: String,
        result: Result<GeneratedTitle>,
    },
    PersistFailed {
        conversation_id: String,
        error: String,
    },
    RenameFailed {
        id: String,
        previous_title: String,
        previous_flag: bool,
        error: String,
    },
    DeleteFailed {
        snapshot: DeleteSnapshot,
        error: String,
    },
    GcSwept {
        conversation_id: String,
        removed: bool,
    },
    RefreshTick,
}

/// Everything needed to put a deleted conversation back on failure.
struct DeleteSnapshot {
    conversation: Conversation,
    messages: Vec<Message>,
    was_active: bool,
}

/// Handle used by UI surfaces to drive the engine and observe its state.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<ChatCommand>,
    state: watch::Receiver<ChatState>,
}

impl ChatHandle {
    pub fn send(&self, command: ChatCommand) {
        if self.commands.send(command).is_err() {
            warn!("chat controller is gone, dropping command");
        }
    }

    pub fn state(&self) -> watch::Receiver<ChatState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }
}

/// The single owning task for all chat state.
///
/// Commands and task results funnel into one loop; no other task ever
/// mutates the store or the reconciler, which is what makes the one-writer
/// invariant hold without locks.
pub struct ChatController {
    config: EngineConfig,
    service: Arc<dyn ConversationService>,
    streams: Arc<dyn StreamService>,
    titles: Arc<dyn TitleGenerator>,
    cache: Arc<dyn KeyedCache>,
    notifier: Arc<dyn NotificationSink>,

    store: ConversationStore,
    reconciler: StreamReconciler,

    /// Open session: (conversation id, token for the consume task).
    stream_cancel: Option<(String, CancelToken)>,
    /// Single-flight guard: conversation ids with a title request in flight.
    titles_in_flight: HashSet<String>,
    detail_loads_in_flight: HashSet<String>,
    refresh_failures: u32,
    refresh_skip: u32,
    last_error: Option<String>,

    internal_tx: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<ChatState>,
}

impl ChatController {
    /// Spawn the controller onto the current runtime and return its handle.
    pub fn spawn(
        config: EngineConfig,
        service: Arc<dyn ConversationService>,
        streams: Arc<dyn StreamService>,
        titles: Arc<dyn TitleGenerator>,
        cache: Arc<dyn KeyedCache>,
        notifier: Arc<dyn NotificationSink>,
    ) -> ChatHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChatState::default());

        let summary_ttl = config.summary_ttl();
        let controller = Self {
            config,
            service,
            streams,
            titles,
            cache,
            notifier,
            store: ConversationStore::new(summary_ttl),
            reconciler: StreamReconciler::new(),
            stream_cancel: None,
            titles_in_flight: HashSet::new(),
            detail_loads_in_flight: HashSet::new(),
            refresh_failures: 0,
            refresh_skip: 0,
            last_error: None,
            internal_tx,
            state_tx,
        };

        tokio::spawn(controller.run(command_rx, internal_rx));

        ChatHandle {
            commands: command_tx,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ChatCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("chat controller started");
        self.spawn_refresh_timer();
        self.load_conversations(false, false);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ChatCommand::Shutdown) | None => {
                        debug!("chat controller shutting down");
                        self.disconnect_stream();
                        self.publish();
                        break;
                    }
                    Some(command) => {
                        self.handle_command(command);
                    }
                },
                Some(event) = internal.recv() => {
                    self.handle_internal(event);
                }
            }
        }
    }

    fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::SendMessage(text) => self.send_message(text),
            ChatCommand::NewConversation => self.start_new_conversation(),
            ChatCommand::SelectConversation(id) => self.select_conversation(id),
            ChatCommand::StopStream => self.disconnect_stream(),
            ChatCommand::RenameConversation { id, title } => self.rename_conversation(id, title),
            ChatCommand::DeleteConversation(id) => self.delete_conversation(id),
            ChatCommand::Refresh { force } => {
                self.load_conversations(force, false);
                if let Some(id) = self.store.active_id().map(str::to_string) {
                    self.load_conversation(&id, false);
                }
            }
            // handled in the run loop
            ChatCommand::Shutdown => {}
        }
        self.publish();
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::StreamEvent {
                conversation_id,
                event,
            } => {
                // publishes itself (token fast path)
                self.on_stream_event(conversation_id, event);
                return;
            }
            Internal::StreamFailed {
                conversation_id,
                error,
            } => self.on_stream_failed(conversation_id, error),
            Internal::StreamClosed { conversation_id } => self.on_stream_closed(conversation_id),
            Internal::SummariesLoaded { result, silent } => {
                self.on_summaries_loaded(result, silent)
            }
            Internal::DetailLoaded {
                conversation_id,
                result,
                silent,
            } => self.on_detail_loaded(conversation_id, result, silent),
            Internal::ConversationCreated {
                result,
                pending_text,
            } => self.on_conversation_created(result, pending_text),
            Internal::BannerExpired { name, epoch } => {
                if !self.reconciler.expire_banner(&name, epoch) {
                    return;
                }
            }
            Internal::TitleGenerated {
                conversation_id,
                result,
            } => self.on_title_generated(conversation_id, result),
            Internal::PersistFailed {
                conversation_id,
                error,
            } => {
                // rendered content is never rolled back; just tell the user
                warn!(conv_id = %conversation_id, error = %error, "message persistence failed");
                self.notifier
                    .notify(Notification::error("Failed to save message"));
            }
            Internal::RenameFailed {
                id,
                previous_title,
                previous_flag,
                error,
            } => {
                warn!(conv_id = %id, error = %error, "rename failed, rolling back");
                self.store.apply_title(&id, previous_title, previous_flag);
                self.notifier
                    .notify(Notification::error("Failed to rename conversation"));
            }
            Internal::DeleteFailed { snapshot, error } => self.on_delete_failed(snapshot, error),
            Internal::GcSwept {
                conversation_id,
                removed,
            } => {
                if removed {
                    debug!(conv_id = %conversation_id, "empty conversation collected");
                    self.store.remove_summary(&conversation_id);
                    self.store.take_messages(&conversation_id);
                }
            }
            Internal::RefreshTick => self.on_refresh_tick(),
        }
        self.publish();
    }

    // ----- conversation list / detail loading -----

    fn load_conversations(&mut self, force: bool, silent: bool) {
        if !force && self.store.summaries_fresh() {
            debug!("summary cache fresh, skipping fetch");
            return;
        }
        self.store.mark_loading(true, silent);

        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = service.list().await;
            let _ = tx.send(Internal::SummariesLoaded { result, silent });
        });
    }

    fn on_summaries_loaded(&mut self, result: ServiceResult<Vec<Conversation>>, silent: bool) {
        self.store.mark_loading(false, silent);
        match result {
            Ok(list) => {
                debug!(count = list.len(), "conversation list loaded");
                self.store.apply_summaries(list);
                self.note_refresh_success();
            }
            Err(e) => {
                if silent {
                    self.note_refresh_failure();
                } else {
                    error!(error = %e, "failed to load conversations");
                    self.last_error = Some(e.to_string());
                    self.notifier
                        .notify(Notification::error("Failed to load conversations"));
                }
            }
        }
    }

    fn load_conversation(&mut self, id: &str, silent: bool) {
        if self.detail_loads_in_flight.contains(id) {
            debug!(conv_id = %id, "detail load already in flight");
            return;
        }
        self.detail_loads_in_flight.insert(id.to_string());
        self.store.mark_loading(true, silent);

        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        let conversation_id = id.to_string();
        tokio::spawn(async move {
            let result = service.get(&conversation_id).await;
            let _ = tx.send(Internal::DetailLoaded {
                conversation_id,
                result,
                silent,
            });
        });
    }

    fn on_detail_loaded(
        &mut self,
        conversation_id: String,
        result: ServiceResult<ConversationDetail>,
        silent: bool,
    ) {
        self.detail_loads_in_flight.remove(&conversation_id);
        self.store.mark_loading(false, silent);
        match result {
            Ok(detail) => {
                self.note_refresh_success();
                // an optimistic delete may have raced this fetch; a server
                // view must not resurrect the conversation locally
                if self.store.summary(&conversation_id).is_none() {
                    debug!(conv_id = %conversation_id, "dropping detail for locally deleted conversation");
                    return;
                }
                let streaming = self.reconciler.target().cloned();
                self.store
                    .apply_detail(&conversation_id, detail.messages, streaming.as_ref());
                self.store.insert_summary(detail.conversation);
            }
            Err(ServiceError::NotFound { .. }) => {
                debug!(conv_id = %conversation_id, "conversation gone server-side, dropping from cache");
                self.store.remove_summary(&conversation_id);
                self.store.take_messages(&conversation_id);
                if self.store.active_id() == Some(conversation_id.as_str()) {
                    self.store.set_active(None);
                }
            }
            Err(e) => {
                if silent {
                    self.note_refresh_failure();
                } else {
                    error!(conv_id = %conversation_id, error = %e, "failed to load conversation");
                    self.last_error = Some(e.to_string());
                    self.notifier
                        .notify(Notification::error("Failed to load conversation"));
                }
            }
        }
    }

    // ----- sending and streaming -----

    fn send_message(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.store.active_id().map(str::to_string) {
            Some(id) => self.begin_exchange(id, text),
            None => {
                debug!("no active conversation, creating one before send");
                self.create_conversation(Some(text));
            }
        }
    }

    fn create_conversation(&mut self, pending_text: Option<String>) {
        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = service.create().await;
            let _ = tx.send(Internal::ConversationCreated {
                result,
                pending_text,
            });
        });
    }

    fn on_conversation_created(
        &mut self,
        result: ServiceResult<Conversation>,
        pending_text: Option<String>,
    ) {
        match result {
            Ok(conversation) => {
                let id = conversation.id.clone();
                info!(conv_id = %id, "conversation created");
                // optimistic: the summary enters the cache right away instead
                // of waiting for the next list refresh
                self.store.insert_summary(conversation);
                self.store.update_conversation_messages(&id, Vec::new(), false);
                self.store.set_active(Some(id.clone()));
                if let Some(text) = pending_text {
                    self.begin_exchange(id, text);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to create conversation");
                self.last_error = Some(e.to_string());
                self.notifier
                    .notify(Notification::error("Failed to create conversation"));
            }
        }
    }

    fn begin_exchange(&mut self, conversation_id: String, text: String) {
        // only one exchange at a time; the newest send wins
        if self.stream_cancel.is_some() || self.reconciler.target().is_some() {
            self.disconnect_stream();
        }

        let mut messages = self
            .store
            .messages(&conversation_id)
            .map(<[Message]>::to_vec)
            .unwrap_or_default();

        // a stray streaming message can survive a crash or a lost session;
        // finalize it so the one-streaming-message invariant holds
        for message in &mut messages {
            if message.status == MessageStatus::Streaming {
                warn!(conv_id = %conversation_id, message_id = %message.id, "finalizing stray streaming message");
                message.status = MessageStatus::Complete;
            }
        }

        let user = Message::user(text.clone());
        let placeholder = Message::assistant_placeholder();
        let placeholder_id = placeholder.id.clone();
        messages.push(user.clone());
        messages.push(placeholder);
        self.store
            .update_conversation_messages(&conversation_id, messages, true);

        self.reconciler.begin_exchange(&conversation_id, &placeholder_id);
        self.last_error = None;

        // fire-and-forget user persistence; failures surface but never block
        self.persist_message(&conversation_id, user);

        let token = CancelToken::new();
        self.stream_cancel = Some((conversation_id.clone(), token.clone()));

        let streams = self.streams.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut stream = match streams.open_stream(&conversation_id, &text).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Internal::StreamFailed {
                        conversation_id,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            while let Some(item) = stream.next().await {
                if token.is_cancelled() {
                    debug!(conv_id = %conversation_id, "stream consume task cancelled");
                    return;
                }
                match item {
                    Ok(event) => {
                        if tx
                            .send(Internal::StreamEvent {
                                conversation_id: conversation_id.clone(),
                                event,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Internal::StreamFailed {
                            conversation_id,
                            error: e.to_string(),
                        });
                        return;
                    }
                }
            }
            let _ = tx.send(Internal::StreamClosed { conversation_id });
        });
    }

    fn on_stream_event(&mut self, conversation_id: String, event: StreamEvent) {
        let mut messages = self
            .store
            .messages(&conversation_id)
            .map(<[Message]>::to_vec)
            .unwrap_or_default();

        let effects = self.reconciler.handle(&event, &conversation_id, &mut messages);

        let terminal = matches!(event.kind, EventKind::Complete | EventKind::Error);
        if event.kind == EventKind::Error {
            self.last_error = Some(
                event
                    .str_field("message")
                    .unwrap_or("stream error")
                    .to_string(),
            );
        }

        // tokens only touch the transient view; message boundaries also
        // update the durable summary
        self.store
            .update_conversation_messages(&conversation_id, messages.clone(), terminal);
        if terminal {
            self.stream_cancel = None;
        }

        for effect in effects {
            self.apply_effect(effect);
        }

        // republish shortcut: a redelivered event that changed nothing
        // visible does not wake subscribers
        if event.kind == EventKind::Token && !self.store.should_publish(&conversation_id, &messages)
        {
            return;
        }
        self.publish();
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::PersistMessage {
                conversation_id,
                message,
            } => self.persist_message(&conversation_id, message),
            Effect::RefreshConversations => self.load_conversations(true, true),
            Effect::MaybeGenerateTitle { conversation_id } => {
                self.maybe_generate_title(&conversation_id)
            }
            Effect::InvalidateCache { keys } => {
                for key in keys {
                    self.cache.remove(key);
                }
            }
            Effect::ScheduleBannerExpiry { name, epoch } => {
                let tx = self.internal_tx.clone();
                let ttl = self.config.banner_ttl();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    let _ = tx.send(Internal::BannerExpired { name, epoch });
                });
            }
        }
    }

    fn persist_message(&self, conversation_id: &str, message: Message) {
        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.append_message(&conversation_id, message).await {
                let _ = tx.send(Internal::PersistFailed {
                    conversation_id,
                    error: e.to_string(),
                });
            }
        });
    }

    fn on_stream_failed(&mut self, conversation_id: String, error: String) {
        error!(conv_id = %conversation_id, error = %error, "stream session failed");
        // route through the reconciler so the terminal transition and its
        // side effects stay in one place
        self.on_stream_event(conversation_id, StreamEvent::stream_error(&error));
    }

    fn on_stream_closed(&mut self, conversation_id: String) {
        if self
            .stream_cancel
            .as_ref()
            .is_some_and(|(id, _)| *id == conversation_id)
        {
            self.stream_cancel = None;
        }
        if self.reconciler.is_streaming(&conversation_id) {
            // the transport ended without a terminal event; a message must
            // never stay stuck in streaming
            debug!(conv_id = %conversation_id, "stream closed without terminal event");
            self.finalize_cancelled();
        }
    }

    /// Deterministically tear down the open session, finalizing and
    /// persisting any partial content.
    fn disconnect_stream(&mut self) {
        if let Some((conversation_id, token)) = self.stream_cancel.take() {
            debug!(conv_id = %conversation_id, "disconnecting stream session");
            token.cancel();
        }
        self.finalize_cancelled();
    }

    fn finalize_cancelled(&mut self) {
        let Some(target) = self.reconciler.target().cloned() else {
            return;
        };
        let mut messages = self
            .store
            .messages(&target.conversation_id)
            .map(<[Message]>::to_vec)
            .unwrap_or_default();
        if let Some(message) = self.reconciler.cancel_exchange(&mut messages) {
            self.store
                .update_conversation_messages(&target.conversation_id, messages, true);
            self.persist_message(&target.conversation_id, message);
        }
    }

    // ----- title generation -----

    fn maybe_generate_title(&mut self, conversation_id: &str) {
        let message_count = self
            .store
            .messages(conversation_id)
            .map_or(0, <[Message]>::len);
        let already_generated = self
            .store
            .summary(conversation_id)
            .is_none_or(|c| c.title_generated);

        if message_count != 2 {
            debug!(conv_id = %conversation_id, message_count, "skipping title generation (count != 2)");
            return;
        }
        if already_generated {
            debug!(conv_id = %conversation_id, "skipping title generation (already generated)");
            return;
        }
        if self.titles_in_flight.contains(conversation_id) {
            debug!(conv_id = %conversation_id, "skipping title generation (request in flight)");
            return;
        }

        self.titles_in_flight.insert(conversation_id.to_string());
        let titles = self.titles.clone();
        let tx = self.internal_tx.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            let result = titles.generate_title(&conversation_id).await;
            let _ = tx.send(Internal::TitleGenerated {
                conversation_id,
                result,
            });
        });
    }

    fn on_title_generated(&mut self, conversation_id: String, result: Result<GeneratedTitle>) {
        self.titles_in_flight.remove(&conversation_id);
        match result {
            Ok(generated) => {
                let title = clean_title(&generated.title);
                debug!(conv_id = %conversation_id, title = %title, fallback = generated.used_fallback, "title generated");
                if self
                    .store
                    .apply_title(&conversation_id, title.clone(), true)
                    .is_none()
                {
                    // conversation disappeared while the request ran
                    return;
                }

                let service = self.service.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let patch = ConversationPatch {
                        title: Some(title),
                        title_generated: Some(true),
                    };
                    if let Err(e) = service.update(&conversation_id, patch).await {
                        warn!(conv_id = %conversation_id, error = %e, "failed to persist generated title");
                        let _ = tx.send(Internal::PersistFailed {
                            conversation_id,
                            error: e.to_string(),
                        });
                    }
                });
            }
            Err(e) => {
                // never blocks the next send and never retries on its own
                warn!(conv_id = %conversation_id, error = %e, "title generation failed");
                self.notifier
                    .notify(Notification::warning("Title generation failed"));
            }
        }
    }

    // ----- conversation lifecycle -----

    fn start_new_conversation(&mut self) {
        self.leave_current();
        self.store.set_active(None);
        self.create_conversation(None);
    }

    fn select_conversation(&mut self, id: String) {
        if self.store.active_id() == Some(id.as_str()) {
            return;
        }
        self.leave_current();
        self.store.set_active(Some(id.clone()));
        self.load_conversation(&id, false);
    }

    /// Disconnect from the conversation being left and garbage-collect it if
    /// it never got a message.
    fn leave_current(&mut self) {
        let Some(previous) = self.store.active_id().map(str::to_string) else {
            return;
        };
        if self.reconciler.is_streaming(&previous) {
            self.disconnect_stream();
        }
        self.maybe_collect_empty(&previous);
    }

    fn maybe_collect_empty(&mut self, conversation_id: &str) {
        let locally_empty = self
            .store
            .messages(conversation_id)
            .is_none_or(<[Message]>::is_empty);
        let server_empty = self
            .store
            .summary(conversation_id)
            .is_some_and(|c| c.message_count == 0);
        let busy = self.reconciler.is_streaming(conversation_id)
            || self.detail_loads_in_flight.contains(conversation_id);
        if !locally_empty || !server_empty || busy {
            return;
        }

        debug!(conv_id = %conversation_id, "collecting empty conversation");
        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            // re-check right before deleting: a send may have just landed
            let still_empty = match service.get(&conversation_id).await {
                Ok(detail) => {
                    detail.messages.is_empty() && detail.conversation.message_count == 0
                }
                Err(ServiceError::NotFound { .. }) => false,
                Err(e) => {
                    debug!(conv_id = %conversation_id, error = %e, "skipping gc, recheck failed");
                    false
                }
            };
            if still_empty && let Err(e) = service.delete(&conversation_id).await {
                debug!(conv_id = %conversation_id, error = %e, "silent delete failed");
                let _ = tx.send(Internal::GcSwept {
                    conversation_id,
                    removed: false,
                });
                return;
            }
            let _ = tx.send(Internal::GcSwept {
                conversation_id,
                removed: still_empty,
            });
        });
    }

    fn rename_conversation(&mut self, id: String, title: String) {
        // a manual rename is authoritative; flag it so a late title
        // generation cannot overwrite it
        let Some((previous_title, previous_flag)) =
            self.store.apply_title(&id, title.clone(), true)
        else {
            warn!(conv_id = %id, "rename for unknown conversation");
            return;
        };

        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let patch = ConversationPatch {
                title: Some(title),
                title_generated: Some(true),
            };
            if let Err(e) = service.update(&id, patch).await {
                let _ = tx.send(Internal::RenameFailed {
                    id,
                    previous_title,
                    previous_flag,
                    error: e.to_string(),
                });
            }
        });
    }

    fn delete_conversation(&mut self, id: String) {
        if self.reconciler.is_streaming(&id) {
            self.disconnect_stream();
        }
        let Some(conversation) = self.store.remove_summary(&id) else {
            warn!(conv_id = %id, "delete for unknown conversation");
            return;
        };
        let messages = self.store.take_messages(&id);
        let was_active = self.store.active_id() == Some(id.as_str());
        if was_active {
            self.store.set_active(None);
        }

        let snapshot = DeleteSnapshot {
            conversation,
            messages,
            was_active,
        };
        let service = self.service.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = service.delete(&id).await {
                let _ = tx.send(Internal::DeleteFailed {
                    snapshot,
                    error: e.to_string(),
                });
            }
        });
    }

    fn on_delete_failed(&mut self, snapshot: DeleteSnapshot, error: String) {
        warn!(conv_id = %snapshot.conversation.id, error = %error, "delete failed, restoring conversation");
        let id = snapshot.conversation.id.clone();
        self.store.insert_summary(snapshot.conversation);
        self.store.restore_messages(&id, snapshot.messages);
        if snapshot.was_active {
            self.store.set_active(Some(id));
        }
        self.notifier
            .notify(Notification::error("Failed to delete conversation"));
    }

    // ----- background refresh -----

    fn spawn_refresh_timer(&self) {
        let tx = self.internal_tx.clone();
        let period = self.config.refresh_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick fires immediately; startup already loads
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(Internal::RefreshTick).is_err() {
                    break;
                }
            }
        });
    }

    fn on_refresh_tick(&mut self) {
        if self.refresh_skip > 0 {
            self.refresh_skip -= 1;
            debug!(remaining = self.refresh_skip, "skipping refresh tick (backoff)");
            return;
        }
        self.load_conversations(true, true);
        if let Some(id) = self.store.active_id().map(str::to_string) {
            self.load_conversation(&id, true);
        }
    }

    fn note_refresh_failure(&mut self) {
        self.refresh_failures += 1;
        let exponent = self.refresh_failures.min(self.config.refresh_backoff_cap);
        self.refresh_skip = (1u32 << exponent) - 1;
        warn!(
            failures = self.refresh_failures,
            skipped_ticks = self.refresh_skip,
            "background refresh failed, backing off"
        );
    }

    fn note_refresh_success(&mut self) {
        if self.refresh_failures > 0 {
            info!("background refresh recovered");
        }
        self.refresh_failures = 0;
        self.refresh_skip = 0;
    }

    // ----- publishing -----

    fn publish(&mut self) {
        let active = self.store.active_id().map(str::to_string);
        let messages = active
            .as_deref()
            .and_then(|id| self.store.messages(id))
            .map(<[Message]>::to_vec)
            .unwrap_or_default();
        let is_streaming = active
            .as_deref()
            .is_some_and(|id| self.reconciler.is_streaming(id));

        let state = ChatState {
            conversations: self.store.summaries().to_vec(),
            active_conversation: active,
            messages,
            is_streaming,
            active_tool: self.reconciler.active_tool().cloned(),
            prompt_preview: self.reconciler.prompt_preview().map(str::to_string),
            error: self.last_error.clone(),
            loading: self.store.is_loading(),
            refresh_degraded: self.refresh_failures >= self.config.refresh_failure_threshold,
        };

        self.state_tx.send_if_modified(|previous| {
            if *previous == state {
                false
            } else {
                *previous = state;
                true
            }
        });
    }
}
