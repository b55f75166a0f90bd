//! Domain records exchanged with the host.
//!
//! Field names serialize in camelCase to match the column names and the
//! shapes the host expects. Opaque documents (`data`, character traits) are
//! kept as `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored character as returned by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub hash: String,
    pub name: String,
    /// Everything the definition carried except `hash`.
    pub data: Value,
}

/// Input shape for creating a character: `hash`, `name`, plus any freeform fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDefinition {
    pub hash: String,
    pub name: String,
    #[serde(flatten)]
    pub traits: Map<String, Value>,
}

impl CharacterDefinition {
    pub fn new(hash: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            name: name.into(),
            traits: Map::new(),
        }
    }

    pub fn with_trait(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.traits.insert(key.into(), value.into());
        self
    }

    /// The persisted `data` document: the definition with `hash` stripped.
    pub fn document(&self) -> Value {
        let mut map = self.traits.clone();
        map.remove("hash");
        map.insert("name".into(), Value::String(self.name.clone()));
        Value::Object(map)
    }
}

/// A participant as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

impl User {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A stored participant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub conversation_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored conversation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub secret: String,
    pub persistence_token: Option<String>,
    pub data: Option<Value>,
    /// `None` once the referenced character has been deleted.
    pub character_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A conversation with its participants and character eagerly loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub users: Vec<Player>,
    pub character: Option<Character>,
}

/// Minimal handle returned when a conversation is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHandle {
    pub id: i64,
    pub secret: String,
}

/// Lookup keys for a conversation. Supplied keys are OR-combined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationFilter {
    pub id: Option<i64>,
    pub secret: Option<String>,
    pub persistence_token: Option<String>,
}

impl ConversationFilter {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    pub fn by_persistence_token(token: impl Into<String>) -> Self {
        Self {
            persistence_token: Some(token.into()),
            ..Default::default()
        }
    }

    /// The id, if one was given and is non-zero.
    pub fn id(&self) -> Option<i64> {
        self.id.filter(|&id| id != 0)
    }

    /// The secret, if one was given and is non-empty.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    /// The persistence token, if one was given and is non-empty.
    pub fn persistence_token(&self) -> Option<&str> {
        self.persistence_token.as_deref().filter(|s| !s.is_empty())
    }

    /// True when no key was meaningfully supplied.
    pub fn is_empty(&self) -> bool {
        self.id().is_none() && self.secret().is_none() && self.persistence_token().is_none()
    }
}

/// One key/value pair of a message's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: String,
}

impl ContextEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A stored message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub role: String,
    pub sender_id: Option<i64>,
    pub conversation_id: i64,
    pub context: Vec<ContextEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message to append to a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub sender_id: Option<i64>,
    pub content: String,
    /// Free-form role tag, e.g. `user` or `assistant`.
    pub role: String,
    #[serde(default)]
    pub context: Vec<ContextEntry>,
}

impl NewMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id: None,
            content: content.into(),
            role: role.into(),
            context: Vec::new(),
        }
    }

    pub fn from_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push(ContextEntry::new(key, value));
        self
    }
}
