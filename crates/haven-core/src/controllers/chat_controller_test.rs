#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use futures::StreamExt;
    use parking_lot::Mutex;

    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::controllers::chat_controller::{ChatCommand, ChatController, ChatHandle, ChatState};
    use crate::models::conversation::Conversation;
    use crate::models::message::{ActiveToolStatus, Message, MessageStatus};
    use crate::models::notifications::NotificationStore;
    use crate::services::conversation_service::BoxFuture;
    use crate::services::event_stream::{ResponseStream, StreamEvent, StreamService};
    use crate::services::in_memory_service::InMemoryConversationService;
    use crate::services::title_generator::{GeneratedTitle, TitleGenerator};

    /// One scripted response session.
    struct Script {
        events: Vec<Result<StreamEvent, String>>,
        then_hang: bool,
    }

    impl Script {
        fn finite(events: Vec<StreamEvent>) -> Self {
            Self {
                events: events.into_iter().map(Ok).collect(),
                then_hang: false,
            }
        }

        /// Emit the events, then keep the session open forever.
        fn hanging(events: Vec<StreamEvent>) -> Self {
            Self {
                events: events.into_iter().map(Ok).collect(),
                then_hang: true,
            }
        }

        /// Emit the events, then fail at the transport level.
        fn failing(events: Vec<StreamEvent>, error: &str) -> Self {
            let mut events: Vec<Result<StreamEvent, String>> =
                events.into_iter().map(Ok).collect();
            events.push(Err(error.to_string()));
            Self {
                events,
                then_hang: false,
            }
        }
    }

    struct ScriptedStreamService {
        scripts: Mutex<VecDeque<Script>>,
    }

    impl StreamService for ScriptedStreamService {
        fn open_stream(
            &self,
            _conversation_id: &str,
            _prompt: &str,
        ) -> BoxFuture<'static, anyhow::Result<ResponseStream>> {
            let script = self.scripts.lock().pop_front().unwrap_or(Script {
                events: Vec::new(),
                then_hang: true,
            });
            Box::pin(async move {
                let stream = async_stream::stream! {
                    for item in script.events {
                        match item {
                            Ok(event) => yield Ok(event),
                            Err(message) => {
                                yield Err(anyhow!(message));
                                return;
                            }
                        }
                    }
                    if script.then_hang {
                        std::future::pending::<()>().await;
                    }
                };
                Ok(stream.boxed())
            })
        }
    }

    struct CountingTitleGenerator {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl TitleGenerator for CountingTitleGenerator {
        fn generate_title(
            &self,
            _conversation_id: &str,
        ) -> BoxFuture<'static, anyhow::Result<GeneratedTitle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(GeneratedTitle {
                    title: "\"Rust async patterns\"".to_string(),
                    used_fallback: false,
                })
            })
        }
    }

    struct Harness {
        handle: ChatHandle,
        service: Arc<InMemoryConversationService>,
        titles: Arc<CountingTitleGenerator>,
        notifications: Arc<NotificationStore>,
    }

    fn harness(
        config: EngineConfig,
        scripts: Vec<Script>,
        title_delay: Duration,
        seeds: Vec<(Conversation, Vec<Message>)>,
    ) -> Harness {
        let service = Arc::new(InMemoryConversationService::new());
        for (conversation, messages) in seeds {
            service.seed(conversation, messages);
        }
        let streams = Arc::new(ScriptedStreamService {
            scripts: Mutex::new(scripts.into()),
        });
        let titles = Arc::new(CountingTitleGenerator {
            calls: AtomicUsize::new(0),
            delay: title_delay,
        });
        let notifications = Arc::new(NotificationStore::new(32));

        let handle = ChatController::spawn(
            config,
            service.clone(),
            streams,
            titles.clone(),
            Arc::new(MemoryCache::new()),
            notifications.clone(),
        );

        Harness {
            handle,
            service,
            titles,
            notifications,
        }
    }

    /// A conversation that already holds one completed exchange.
    fn seeded_conversation(id: &str) -> (Conversation, Vec<Message>) {
        let mut conversation = Conversation::new(id);
        conversation.message_count = 2;
        conversation.title_generated = true;

        let user = Message::user("Hello");
        let mut assistant = Message::assistant_placeholder();
        assistant.status = MessageStatus::Complete;
        assistant.content = "Hi there".to_string();

        (conversation, vec![user, assistant])
    }

    async fn wait_for<F>(handle: &ChatHandle, mut predicate: F) -> ChatState
    where
        F: FnMut(&ChatState) -> bool,
    {
        let mut rx = handle.state();
        for _ in 0..5_000 {
            {
                let state = rx.borrow_and_update().clone();
                if predicate(&state) {
                    return state;
                }
            }
            tokio::select! {
                changed = rx.changed() => changed.expect("controller gone"),
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
        }
        panic!("timed out waiting for state: {:?}", handle.snapshot());
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..5_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for condition");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_hello_creates_conversation_and_streams() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::finite(vec![
                StreamEvent::token("Hi"),
                StreamEvent::token(" there"),
                StreamEvent::complete(),
            ])],
            Duration::ZERO,
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));

        let state = wait_for(&h.handle, |s| {
            s.messages.len() == 2 && s.messages[1].status == MessageStatus::Complete
        })
        .await;

        assert_eq!(state.messages[0].content, "Hello");
        assert_eq!(state.messages[0].status, MessageStatus::Complete);
        assert_eq!(state.messages[1].content, "Hi there");
        assert!(!state.is_streaming);

        let conv_id = state.active_conversation.expect("conversation created");

        // both messages reach the service
        let service = h.service.clone();
        let id = conv_id.clone();
        wait_until(move || service.messages(&id).len() == 2).await;

        // title generation ran once and its result was applied and persisted
        wait_for(&h.handle, |s| {
            s.conversations
                .iter()
                .any(|c| c.id == conv_id && c.title == "Rust async patterns" && c.title_generated)
        })
        .await;
        assert_eq!(h.titles.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_preserves_streaming_message() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::hanging(vec![StreamEvent::token("Hi")])],
            Duration::ZERO,
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));
        let state = wait_for(&h.handle, |s| {
            s.is_streaming && s.messages.len() == 2 && s.messages[1].content == "Hi"
        })
        .await;
        let conv_id = state.active_conversation.clone().unwrap();

        // wait for the user message to land server-side; the streaming
        // assistant message is still unknown to the server
        let service = h.service.clone();
        let id = conv_id.clone();
        wait_until(move || service.messages(&id).len() == 1).await;

        h.handle.send(ChatCommand::Refresh { force: true });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = h.handle.snapshot();
        assert_eq!(state.messages.len(), 2, "refresh must not erase live output");
        assert!(state.messages[1].is_streaming());
        assert_eq!(state.messages[1].content, "Hi");
        assert!(state.is_streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_stream_finalizes_partial_content() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::hanging(vec![StreamEvent::token("partial")])],
            Duration::ZERO,
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));
        wait_for(&h.handle, |s| {
            s.is_streaming && s.messages.len() == 2 && s.messages[1].content == "partial"
        })
        .await;

        h.handle.send(ChatCommand::StopStream);
        let state = wait_for(&h.handle, |s| !s.is_streaming).await;

        assert_eq!(state.messages[1].status, MessageStatus::Complete);
        assert_eq!(state.messages[1].content, "partial");

        // the partial response is persisted, not lost
        let conv_id = state.active_conversation.unwrap();
        let service = h.service.clone();
        wait_until(move || service.messages(&conv_id).len() == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_restores_conversation_detail_and_selection() {
        let h = harness(
            EngineConfig::default(),
            Vec::new(),
            Duration::ZERO,
            vec![seeded_conversation("c-1")],
        );

        h.handle.send(ChatCommand::SelectConversation("c-1".to_string()));
        wait_for(&h.handle, |s| {
            s.active_conversation.as_deref() == Some("c-1") && s.messages.len() == 2
        })
        .await;

        h.service.set_fail(true);
        h.handle.send(ChatCommand::DeleteConversation("c-1".to_string()));

        let state = wait_for(&h.handle, |s| {
            s.conversations.iter().any(|c| c.id == "c-1")
                && s.active_conversation.as_deref() == Some("c-1")
                && s.messages.len() == 2
        })
        .await;

        assert_eq!(state.messages[1].content, "Hi there");
        assert!(h.notifications.error_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_failure_rolls_back_title() {
        let h = harness(
            EngineConfig::default(),
            Vec::new(),
            Duration::ZERO,
            vec![seeded_conversation("c-1")],
        );
        wait_for(&h.handle, |s| s.conversations.iter().any(|c| c.id == "c-1")).await;

        h.service.set_fail(true);
        h.handle.send(ChatCommand::RenameConversation {
            id: "c-1".to_string(),
            title: "My notes".to_string(),
        });

        let notifications = h.notifications.clone();
        wait_until(move || notifications.error_count() >= 1).await;

        let state = h.handle.snapshot();
        let conversation = state.conversations.iter().find(|c| c.id == "c-1").unwrap();
        assert_eq!(conversation.title, "New Chat");
        assert!(conversation.title_generated, "seeded flag must be restored");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_banner_expires_after_ttl() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::hanging(vec![
                StreamEvent::tool_start("search"),
                StreamEvent::tool_end("search", "success"),
            ])],
            Duration::ZERO,
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));
        let state = wait_for(&h.handle, |s| {
            s.active_tool
                .as_ref()
                .is_some_and(|t| t.name == "search" && t.status == ActiveToolStatus::Success)
        })
        .await;
        assert!(state.is_streaming);

        // 4.5s later the banner clears on its own, stream still open
        let state = wait_for(&h.handle, |s| s.active_tool.is_none()).await;
        assert!(state.is_streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_tool_start_replaces_finished_banner() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::hanging(vec![
                StreamEvent::tool_start("search"),
                StreamEvent::tool_end("search", "success"),
                StreamEvent::tool_start("fetch"),
            ])],
            Duration::ZERO,
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));
        wait_for(&h.handle, |s| {
            s.active_tool
                .as_ref()
                .is_some_and(|t| t.name == "fetch" && t.status == ActiveToolStatus::Running)
        })
        .await;

        // the stale expiry armed for "search" must not clear the new banner
        tokio::time::sleep(Duration::from_secs(10)).await;
        let state = h.handle.snapshot();
        assert!(
            state
                .active_tool
                .as_ref()
                .is_some_and(|t| t.name == "fetch"),
            "late timer cleared a newer banner"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_conversation_collected_on_switch() {
        let h = harness(
            EngineConfig::default(),
            Vec::new(),
            Duration::ZERO,
            vec![seeded_conversation("c-1")],
        );
        wait_for(&h.handle, |s| s.conversations.iter().any(|c| c.id == "c-1")).await;

        h.handle.send(ChatCommand::NewConversation);
        let state = wait_for(&h.handle, |s| {
            s.active_conversation.is_some() && s.conversations.len() == 2
        })
        .await;
        let empty_id = state.active_conversation.unwrap();

        h.handle.send(ChatCommand::SelectConversation("c-1".to_string()));

        let service = h.service.clone();
        let id = empty_id.clone();
        wait_until(move || service.conversation(&id).is_none()).await;
        wait_for(&h.handle, |s| !s.conversations.iter().any(|c| c.id == empty_id)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_surfaces_notification_without_rollback() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::finite(vec![
                StreamEvent::token("Hi"),
                StreamEvent::complete(),
            ])],
            Duration::ZERO,
            vec![{
                let (mut conversation, _) = seeded_conversation("c-1");
                conversation.message_count = 0;
                conversation.title_generated = false;
                (conversation, Vec::new())
            }],
        );

        h.handle.send(ChatCommand::SelectConversation("c-1".to_string()));
        wait_for(&h.handle, |s| s.active_conversation.as_deref() == Some("c-1")).await;

        h.service.set_fail(true);
        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));

        let notifications = h.notifications.clone();
        wait_until(move || notifications.error_count() >= 1).await;

        // a user must never see text they already read disappear
        let state = wait_for(&h.handle, |s| {
            s.messages.len() == 2 && s.messages[1].status == MessageStatus::Complete
        })
        .await;
        assert_eq!(state.messages[1].content, "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_marks_message_and_surfaces_error() {
        let h = harness(
            EngineConfig::default(),
            vec![Script::failing(
                vec![StreamEvent::token("half")],
                "connection reset",
            )],
            Duration::ZERO,
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("Hello".to_string()));

        let state = wait_for(&h.handle, |s| {
            s.messages.len() == 2 && s.messages[1].status == MessageStatus::Error
        })
        .await;

        assert_eq!(state.messages[1].content, "half", "partial content retained");
        assert_eq!(state.messages[1].error.as_deref(), Some("connection reset"));
        assert_eq!(state.error.as_deref(), Some("connection reset"));
        assert!(!state.is_streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_completions_request_title_once() {
        let h = harness(
            EngineConfig::default(),
            vec![
                Script::finite(vec![StreamEvent::token("Hi"), StreamEvent::complete()]),
                Script::finite(vec![StreamEvent::token("More"), StreamEvent::complete()]),
            ],
            // keep the first request in flight while the second send lands
            Duration::from_secs(600),
            Vec::new(),
        );

        h.handle.send(ChatCommand::SendMessage("one".to_string()));
        wait_for(&h.handle, |s| {
            s.messages.len() == 2 && s.messages[1].status == MessageStatus::Complete
        })
        .await;

        h.handle.send(ChatCommand::SendMessage("two".to_string()));
        wait_for(&h.handle, |s| {
            s.messages.len() == 4 && s.messages[3].status == MessageStatus::Complete
        })
        .await;

        assert_eq!(h.titles.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_backoff_sets_and_clears_degraded_flag() {
        let config = EngineConfig {
            refresh_interval_ms: 1_000,
            ..EngineConfig::default()
        };
        let h = harness(config, Vec::new(), Duration::ZERO, Vec::new());

        // initial load succeeds
        wait_for(&h.handle, |s| !s.loading).await;

        h.service.set_fail(true);
        wait_for(&h.handle, |s| s.refresh_degraded).await;

        h.service.set_fail(false);
        let state = wait_for(&h.handle, |s| !s.refresh_degraded).await;
        assert!(!state.refresh_degraded);
    }
}
