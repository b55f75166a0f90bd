//! Table and column names for the four persisted tables.
//!
//! Column lists are positional: the row mappers in `libsql_backend` read
//! by index in exactly this order.

use std::fmt;

/// A persisted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Table {
    Character,
    Conversation,
    Player,
    Message,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Character => "Character",
            Table::Conversation => "Conversation",
            Table::Player => "Player",
            Table::Message => "Message",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Character => CHARACTER_COLUMNS,
            Table::Conversation => CONVERSATION_COLUMNS,
            Table::Player => PLAYER_COLUMNS,
            Table::Message => MESSAGE_COLUMNS,
        }
    }

    /// Comma-separated, table-qualified column list for SELECTs.
    pub fn select_list(self) -> String {
        self.columns()
            .iter()
            .map(|c| format!("{}.{}", self.name(), c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const CHARACTER_COLUMNS: &[&str] = &["hash", "name", "data", "createdAt", "updatedAt"];

pub const CONVERSATION_COLUMNS: &[&str] = &[
    "id",
    "secret",
    "persistenceToken",
    "data",
    "characterHash",
    "createdAt",
    "updatedAt",
];

pub const PLAYER_COLUMNS: &[&str] = &["id", "name", "conversationId", "createdAt", "updatedAt"];

pub const MESSAGE_COLUMNS: &[&str] = &[
    "id",
    "content",
    "role",
    "senderId",
    "conversationId",
    "context",
    "createdAt",
    "updatedAt",
];
