pub mod conversation;
pub mod message;

pub use conversation::{Conversation, ConversationStats};
pub use message::{Message, MessageRole};
