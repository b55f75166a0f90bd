//! `StorageAdapter` trait: the persistence contract the host calls into.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DatabaseError;
use crate::model::{
    Character, CharacterDefinition, ConversationFilter, ConversationHandle, ConversationView,
    Message, NewMessage, User,
};

/// Backend-agnostic storage for characters, conversations and messages.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Apply pending schema migrations. Safe to call more than once.
    async fn init(&self) -> Result<(), DatabaseError>;

    // ── Characters ──────────────────────────────────────────────────

    /// Get a character by hash.
    async fn get_character(&self, hash: &str) -> Result<Option<Character>, DatabaseError>;

    /// Store a character unless one with the same hash exists.
    ///
    /// An existing record is returned unchanged; the input is ignored.
    async fn create_character(
        &self,
        character: &CharacterDefinition,
    ) -> Result<Character, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Create a conversation for an existing character and attach `users` to it.
    async fn create_conversation(
        &self,
        character_hash: &str,
        users: &[User],
        persistence_token: Option<&str>,
    ) -> Result<ConversationHandle, DatabaseError>;

    /// Find a conversation by id, secret or persistence token.
    async fn get_conversation_by(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Option<ConversationView>, DatabaseError>;

    /// Shallow-merge `patch` into the conversation's data document.
    async fn set_conversation_data(
        &self,
        conversation_id: i64,
        patch: &Value,
    ) -> Result<(), DatabaseError>;

    /// Point each user at this conversation, creating players as needed.
    async fn set_conversation_users(
        &self,
        conversation_id: i64,
        users: &[User],
    ) -> Result<(), DatabaseError>;

    /// Swap the conversation's character. Clears its message history when the
    /// character actually changes.
    async fn set_conversation_character(
        &self,
        conversation_id: i64,
        character_hash: &str,
    ) -> Result<(), DatabaseError>;

    /// Delete the conversation and its messages. Players are detached, not deleted.
    async fn finish_conversation(&self, conversation_id: i64) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// List a conversation's messages, newest first.
    async fn get_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Append a message to a conversation.
    async fn add_message_to_conversation(
        &self,
        conversation_id: i64,
        message: &NewMessage,
    ) -> Result<(), DatabaseError>;
}
