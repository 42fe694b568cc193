pub mod conversation;
pub mod directory;

pub use conversation::{Applied, ConversationStore, RetryTicket};
pub use directory::DirectoryCache;
