pub mod conversation_service;
pub mod error;
pub mod event_stream;
pub mod in_memory_service;
pub mod title_generator;

pub use conversation_service::{
    BoxFuture, ConversationDetail, ConversationPatch, ConversationService,
};
pub use error::{ServiceError, ServiceResult};
pub use event_stream::{EventKind, ResponseStream, StreamEvent, StreamService};
pub use in_memory_service::InMemoryConversationService;
pub use title_generator::{GeneratedTitle, TitleGenerator, clean_title};
