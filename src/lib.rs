//! Conversation store: persists characters, conversations, players and
//! messages for a conversational host on libSQL / SQLite.

pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use config::AdapterOptions;
pub use error::{ConfigError, DatabaseError, Error, Result};
pub use model::{
    Character, CharacterDefinition, ContextEntry, Conversation, ConversationFilter,
    ConversationHandle, ConversationView, Message, NewMessage, Player, User,
};
pub use store::{LibSqlAdapter, StorageAdapter};
