pub mod chat;
pub mod chat_timeline;
pub mod chats_store;
pub mod clock;
pub mod edited_message;
pub mod entity_cache;
pub mod events;
pub mod generation_orchestrator;
pub mod message;
pub mod message_view;
pub mod preview_images;
mod variations;

pub use chat::ChatRecord;
pub use chat_timeline::{ChatContext, ChatTimeline};
pub use chats_store::{ChatStore, SearchHit};
pub use edited_message::EditedMessageHandler;
pub use entity_cache::EntityCache;
pub use events::{ChatEvent, EventBus};
pub use generation_orchestrator::{GenerationError, GenerationOrchestrator, GenerationOutcome};
pub use message::{MessageError, MessageExtras, MessageRecord};
pub use message_view::{MessageContext, MessageView};
pub use preview_images::PreviewImageHandler;
