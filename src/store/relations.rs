//! Declarative relation graph between the tables.
//!
//! Each entry names one side of a foreign key. Queries that eager-load a
//! related row (a conversation's character, its players, its messages)
//! build their join or filter clause from here instead of spelling it out.

use super::schema::Table;

/// An edge from `source` to `target`, joined on
/// `source.source_column = target.target_column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Relation {
    pub source: Table,
    pub source_column: &'static str,
    pub target: Table,
    pub target_column: &'static str,
}

impl Relation {
    /// `Target.col = Source.col`
    pub fn join_condition(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.target, self.target_column, self.source, self.source_column
        )
    }

    /// `LEFT JOIN Target ON ...`, for eager-loading from the source side.
    pub fn left_join(&self) -> String {
        format!("LEFT JOIN {} ON {}", self.target, self.join_condition())
    }

    /// Predicate selecting target rows that belong to the source row bound at `?{param}`.
    pub fn target_filter(&self, param: usize) -> String {
        format!("{}.{} = ?{}", self.target, self.target_column, param)
    }
}

pub(crate) static CONVERSATION_CHARACTER: Relation = Relation {
    source: Table::Conversation,
    source_column: "characterHash",
    target: Table::Character,
    target_column: "hash",
};

pub(crate) static CONVERSATION_PLAYERS: Relation = Relation {
    source: Table::Conversation,
    source_column: "id",
    target: Table::Player,
    target_column: "conversationId",
};

pub(crate) static CONVERSATION_MESSAGES: Relation = Relation {
    source: Table::Conversation,
    source_column: "id",
    target: Table::Message,
    target_column: "conversationId",
};
