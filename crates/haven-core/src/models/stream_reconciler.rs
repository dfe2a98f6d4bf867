use chrono::Utc;
use tracing::{debug, warn};

use super::message::{
    ActiveTool, ActiveToolStatus, Message, MessageRole, MessageStatus, ToolCall, ToolCallStatus,
};
use crate::services::event_stream::{EventKind, StreamEvent};

/// The message currently receiving token/tool events for an open exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamTarget {
    pub conversation_id: String,
    pub message_id: String,
}

/// Side effects requested by the reconciler and executed by the controller.
///
/// Keeping the reconciler free of I/O makes every event handler a plain
/// state transition that tests can drive directly.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Persist a finalized message through the conversations service.
    PersistMessage {
        conversation_id: String,
        message: Message,
    },
    /// Refresh the summary list after a message boundary.
    RefreshConversations,
    /// Attempt title generation under the controller's single-flight guard.
    MaybeGenerateTitle { conversation_id: String },
    /// Drop foreign-domain cache keys after a side-effect tool ran.
    InvalidateCache { keys: &'static [&'static str] },
    /// Arm the tool-banner auto-expiry timer for this epoch.
    ScheduleBannerExpiry { name: String, epoch: u64 },
}

/// Ordered-event state machine for one in-flight exchange.
///
/// Consumes the opaque event sequence and mutates the target conversation's
/// message list. Every mutation is written back through the store by the
/// controller; the reconciler never holds message state of its own beyond
/// the target id and the transient banner.
pub struct StreamReconciler {
    target: Option<StreamTarget>,
    active_tool: Option<ActiveTool>,
    /// Bumped on every banner change; a pending expiry timer carries the
    /// epoch it was armed with and is ignored if the banner moved on.
    banner_epoch: u64,
    prompt_preview: Option<String>,
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self {
            target: None,
            active_tool: None,
            banner_epoch: 0,
            prompt_preview: None,
        }
    }

    /// Record the event target for a freshly opened exchange.
    /// Only the most recent call wins; there is no queue of targets.
    pub fn begin_exchange(&mut self, conversation_id: &str, message_id: &str) {
        debug!(conv_id = %conversation_id, message_id = %message_id, "exchange target set");
        self.target = Some(StreamTarget {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
        self.prompt_preview = None;
    }

    pub fn target(&self) -> Option<&StreamTarget> {
        self.target.as_ref()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| t.conversation_id == conversation_id)
    }

    pub fn active_tool(&self) -> Option<&ActiveTool> {
        self.active_tool.as_ref()
    }

    pub fn prompt_preview(&self) -> Option<&str> {
        self.prompt_preview.as_deref()
    }

    /// Apply one event to the given conversation's message list.
    ///
    /// Safe to call with redelivered events: toolCall/toolResult upserts and
    /// the terminal transitions are no-ops the second time.
    pub fn handle(
        &mut self,
        event: &StreamEvent,
        conversation_id: &str,
        messages: &mut Vec<Message>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event.kind {
            EventKind::Token => {
                let Some(text) = event.str_field("text") else {
                    return effects;
                };
                let Some(index) = self.target_index(conversation_id, messages) else {
                    warn!(conv_id = %conversation_id, "token event with no streaming target");
                    return effects;
                };
                let message = &mut messages[index];
                if message.needs_newline == Some(true) {
                    // keep narration after an errored tool visually separated
                    // without relying on the model to emit formatting; an
                    // empty message has nothing to separate from
                    if !message.content.is_empty()
                        && !message.content.ends_with('\n')
                        && !text.starts_with('\n')
                    {
                        message.content.push_str("\n\n");
                    }
                    message.needs_newline = Some(false);
                }
                message.content.push_str(text);
            }

            EventKind::ToolCall => {
                let Some(call) = tool_call_from_event(event, ToolCallStatus::Running) else {
                    return effects;
                };
                if let Some(index) = self.target_index(conversation_id, messages) {
                    messages[index].upsert_tool_call(call);
                }
            }

            EventKind::ToolResult => {
                let status = match event.str_field("status") {
                    Some("error") => ToolCallStatus::Error,
                    _ => ToolCallStatus::Success,
                };
                let Some(call) = tool_call_from_event(event, status) else {
                    return effects;
                };
                if let Some(index) = self.target_index(conversation_id, messages) {
                    messages[index].merge_tool_result(call);
                }
            }

            EventKind::ToolStart => {
                let Some(name) = event.str_field("name") else {
                    return effects;
                };
                self.banner_epoch += 1;
                self.active_tool = Some(ActiveTool {
                    name: name.to_string(),
                    status: ActiveToolStatus::Running,
                    started_at: Utc::now(),
                });
            }

            EventKind::ToolEnd => {
                let Some(name) = event.str_field("name") else {
                    return effects;
                };
                let status = match event.str_field("status") {
                    Some("error") => ActiveToolStatus::Error,
                    _ => ActiveToolStatus::Success,
                };
                let started_at = self
                    .active_tool
                    .as_ref()
                    .filter(|t| t.name == name)
                    .map(|t| t.started_at)
                    .unwrap_or_else(Utc::now);
                self.banner_epoch += 1;
                self.active_tool = Some(ActiveTool {
                    name: name.to_string(),
                    status,
                    started_at,
                });
                effects.push(Effect::ScheduleBannerExpiry {
                    name: name.to_string(),
                    epoch: self.banner_epoch,
                });
                if status == ActiveToolStatus::Error
                    && let Some(index) = self.target_index(conversation_id, messages)
                {
                    messages[index].needs_newline = Some(true);
                }
            }

            EventKind::Complete => {
                effects.extend(self.finalize(conversation_id, messages, MessageStatus::Complete, None));
            }

            EventKind::Error => {
                let reason = event
                    .str_field("message")
                    .unwrap_or("stream error")
                    .to_string();
                effects.extend(self.finalize(
                    conversation_id,
                    messages,
                    MessageStatus::Error,
                    Some(reason),
                ));
            }

            EventKind::PromptPreview => {
                self.prompt_preview = event.str_field("text").map(str::to_string);
            }

            // side-effect tool touched another domain: no message mutation,
            // only drop the named cache keys
            kind => {
                let keys = kind.invalidated_keys();
                if !keys.is_empty() {
                    effects.push(Effect::InvalidateCache { keys });
                }
            }
        }

        effects
    }

    /// Timer callback for banner auto-expiry. A late timer must never clear a
    /// newer tool's banner, so both the epoch and the name are checked.
    /// Returns true when the banner was actually cleared.
    pub fn expire_banner(&mut self, name: &str, epoch: u64) -> bool {
        if self.banner_epoch == epoch
            && self.active_tool.as_ref().is_some_and(|t| t.name == name)
        {
            debug!(tool = %name, "tool banner expired");
            self.active_tool = None;
            true
        } else {
            false
        }
    }

    /// Deterministic disconnect: finalize a still-streaming target with its
    /// partial content even though no terminal event ever arrived. Returns
    /// the finalized message for persistence.
    pub fn cancel_exchange(&mut self, messages: &mut [Message]) -> Option<Message> {
        let target = self.target.take()?;
        self.active_tool = None;
        self.banner_epoch += 1;
        self.prompt_preview = None;

        let message = messages.iter_mut().find(|m| m.id == target.message_id)?;
        if message.status == MessageStatus::Streaming {
            message.status = MessageStatus::Complete;
            debug!(
                conv_id = %target.conversation_id,
                message_id = %target.message_id,
                "exchange cancelled, partial content finalized"
            );
            Some(message.clone())
        } else {
            None
        }
    }

    /// Shared terminal transition for complete/error events.
    fn finalize(
        &mut self,
        conversation_id: &str,
        messages: &mut [Message],
        status: MessageStatus,
        error: Option<String>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(index) = self.target_index(conversation_id, messages) {
            let message = &mut messages[index];
            if message.status == MessageStatus::Streaming {
                // partial content is preserved either way, never discarded
                message.status = status;
                message.error = error;
                effects.push(Effect::PersistMessage {
                    conversation_id: conversation_id.to_string(),
                    message: message.clone(),
                });
                effects.push(Effect::RefreshConversations);
                effects.push(Effect::MaybeGenerateTitle {
                    conversation_id: conversation_id.to_string(),
                });
            }
        }

        self.target = None;
        self.prompt_preview = None;
        effects
    }

    /// Resolve the index of the streaming target in `messages`.
    ///
    /// If the tracked id is gone (in-memory tracking lost mid-stream), fall
    /// back to any assistant message still streaming and re-adopt it.
    fn target_index(&mut self, conversation_id: &str, messages: &[Message]) -> Option<usize> {
        if let Some(target) = &self.target
            && target.conversation_id == conversation_id
            && let Some(index) = messages.iter().position(|m| m.id == target.message_id)
        {
            return Some(index);
        }

        let index = messages
            .iter()
            .position(|m| m.role == MessageRole::Assistant && m.status == MessageStatus::Streaming)?;
        debug!(
            conv_id = %conversation_id,
            message_id = %messages[index].id,
            "re-adopted streaming message as event target"
        );
        self.target = Some(StreamTarget {
            conversation_id: conversation_id.to_string(),
            message_id: messages[index].id.clone(),
        });
        Some(index)
    }
}

impl Default for StreamReconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a `ToolCall` from an event payload, reading fields defensively.
/// Events without an id are dropped; there is nothing to upsert by.
fn tool_call_from_event(event: &StreamEvent, status: ToolCallStatus) -> Option<ToolCall> {
    let id = event.str_field("id")?;
    let mut call = ToolCall::new(id, event.str_field("name").unwrap_or_default());
    call.parameters = event.map_field("parameters").cloned().unwrap_or_default();
    call.result = event.str_field("result").map(str::to_string);
    call.status = status;
    Some(call)
}
