pub mod conversation;
pub mod conversations_store;
pub mod message;
pub mod notifications;
pub mod stream_reconciler;

pub use conversation::Conversation;
pub use conversations_store::ConversationStore;
pub use message::{
    ActiveTool, ActiveToolStatus, Message, MessageRole, MessageStatus, ToolCall, ToolCallStatus,
};
pub use notifications::{Notification, NotificationLevel, NotificationSink, NotificationStore};
pub use stream_reconciler::{Effect, StreamReconciler, StreamTarget};
