//! libSQL backend: async `StorageAdapter` implementation.
//!
//! Works against local files, in-memory databases and remote libSQL
//! servers. A single connection is reused for all operations and guarded
//! by an async mutex, so a transaction never picks up statements issued by
//! another caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use secrecy::SecretString;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::AdapterOptions;
use crate::error::{DatabaseError, Error};
use crate::model::{
    Character, CharacterDefinition, ContextEntry, Conversation, ConversationFilter,
    ConversationHandle, ConversationView, Message, NewMessage, Player, User,
};
use crate::store::connection;
use crate::store::migrations;
use crate::store::relations::{CONVERSATION_CHARACTER, CONVERSATION_MESSAGES, CONVERSATION_PLAYERS};
use crate::store::schema::Table;
use crate::store::traits::StorageAdapter;

/// libSQL storage adapter.
pub struct LibSqlAdapter {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlAdapter {
    /// Connect using adapter options. Call [`StorageAdapter::init`] before use.
    pub async fn new(options: &AdapterOptions) -> Result<Self, Error> {
        Self::open(&options.connection_string, options.auth_token.as_ref()).await
    }

    /// Connect to `url`. Call [`StorageAdapter::init`] before use.
    pub async fn open(url: &str, auth_token: Option<&SecretString>) -> Result<Self, Error> {
        let (db, conn) = connection::open(url, auth_token).await?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database with the schema applied (for tests).
    pub async fn new_memory() -> Result<Self, Error> {
        let adapter = Self::open(":memory:", None).await?;
        adapter.init().await?;
        Ok(adapter)
    }

    /// Lock the connection for the duration of one operation.
    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Highest applied migration version.
    pub async fn schema_version(&self) -> Result<i64, DatabaseError> {
        migrations::current_version(&*self.conn().await).await
    }

    /// Get a player by id.
    pub async fn get_player(&self, id: i64) -> Result<Option<Player>, DatabaseError> {
        let op = "Failed to get player";
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM Player WHERE Player.id = ?1",
                    Table::Player.select_list()
                ),
                params![id],
            )
            .await
            .map_err(query_err(op))?;

        match rows.next().await.map_err(query_err(op))? {
            Some(row) => Ok(Some(row_to_player(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

async fn begin(conn: &Connection, op: &str) -> Result<Transaction, DatabaseError> {
    conn.transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: begin transaction: {e}")))
}

/// Commit on success, roll back on failure.
async fn settle<T>(
    tx: Transaction,
    result: Result<T, DatabaseError>,
    op: &str,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op}: commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "{op}: rollback failed");
            }
            Err(err)
        }
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // CURRENT_TIMESTAMP column defaults, with or without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    warn!(value = s, "Unparseable timestamp in row");
    Err(DatabaseError::Serialization(format!("invalid timestamp: {s:?}")))
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Read a column that may be NULL as text.
fn get_opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    match row.get_value(idx).map_err(row_err)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Text(s) => Ok(Some(s)),
        libsql::Value::Blob(b) => String::from_utf8(b).map(Some).map_err(|e| {
            DatabaseError::Serialization(format!("column {idx} is not valid UTF-8: {e}"))
        }),
        libsql::Value::Integer(i) => Ok(Some(i.to_string())),
        libsql::Value::Real(r) => Ok(Some(r.to_string())),
    }
}

fn get_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    get_opt_text(row, idx)?
        .ok_or_else(|| DatabaseError::Query(format!("row parse: column {idx} is NULL")))
}

fn get_opt_i64(row: &libsql::Row, idx: i32) -> Result<Option<i64>, DatabaseError> {
    match row.get_value(idx).map_err(row_err)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Integer(i) => Ok(Some(i)),
        other => Err(DatabaseError::Query(format!(
            "row parse: column {idx} is not an integer: {other:?}"
        ))),
    }
}

fn get_ts(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>, DatabaseError> {
    parse_datetime(&get_text(row, idx)?)
}

fn parse_json(raw: &str) -> Result<Value, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(i: Option<i64>) -> libsql::Value {
    match i {
        Some(i) => libsql::Value::Integer(i),
        None => libsql::Value::Null,
    }
}

/// Overlay the top-level keys of `patch` onto `current`.
///
/// A missing or non-object current document counts as empty; a non-object
/// patch replaces the document outright.
fn merge_document(current: Option<Value>, patch: &Value) -> Value {
    let Value::Object(patch) = patch else {
        return patch.clone();
    };
    let mut merged = match current {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Map columns `offset..` (in `Table::Character` order) to a Character.
/// Returns `None` when the hash is NULL, i.e. an unmatched LEFT JOIN.
fn row_to_character(row: &libsql::Row, offset: i32) -> Result<Option<Character>, DatabaseError> {
    let Some(hash) = get_opt_text(row, offset)? else {
        return Ok(None);
    };
    Ok(Some(Character {
        hash,
        name: get_text(row, offset + 1)?,
        data: parse_json(&get_text(row, offset + 2)?)?,
    }))
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    Ok(Conversation {
        id: row.get(0).map_err(row_err)?,
        secret: get_text(row, 1)?,
        persistence_token: get_opt_text(row, 2)?,
        data: get_opt_text(row, 3)?.map(|raw| parse_json(&raw)).transpose()?,
        character_hash: get_opt_text(row, 4)?,
        created_at: get_ts(row, 5)?,
        updated_at: get_ts(row, 6)?,
    })
}

fn row_to_player(row: &libsql::Row) -> Result<Player, DatabaseError> {
    Ok(Player {
        id: row.get(0).map_err(row_err)?,
        name: get_text(row, 1)?,
        conversation_id: get_opt_i64(row, 2)?,
        created_at: get_ts(row, 3)?,
        updated_at: get_ts(row, 4)?,
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let context = match get_opt_text(row, 5)? {
        Some(raw) => serde_json::from_str::<Vec<ContextEntry>>(&raw)
            .map_err(|e| DatabaseError::Serialization(format!("message context: {e}")))?,
        None => Vec::new(),
    };
    Ok(Message {
        id: row.get(0).map_err(row_err)?,
        content: get_text(row, 1)?,
        role: get_text(row, 2)?,
        sender_id: get_opt_i64(row, 3)?,
        conversation_id: row.get(4).map_err(row_err)?,
        context,
        created_at: get_ts(row, 6)?,
        updated_at: get_ts(row, 7)?,
    })
}

/// Insert the player or, if the id exists, rename it and re-point it at `conversation_id`.
async fn upsert_player(
    conn: &Connection,
    conversation_id: i64,
    user: &User,
) -> Result<(), libsql::Error> {
    conn.execute(
        "INSERT INTO Player (id, name, conversationId, updatedAt)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            conversationId = excluded.conversationId,
            updatedAt = excluded.updatedAt",
        params![user.id, user.name.as_str(), conversation_id, now()],
    )
    .await?;
    Ok(())
}

async fn insert_conversation_with_players(
    conn: &Connection,
    character_hash: &str,
    users: &[User],
    persistence_token: Option<&str>,
) -> Result<ConversationHandle, DatabaseError> {
    let op = "Failed to create conversation";
    let handle = {
        let mut rows = conn
            .query(
                "INSERT INTO Conversation (persistenceToken, characterHash, updatedAt)
                 VALUES (?1, ?2, ?3)
                 RETURNING id, secret",
                params![opt_text(persistence_token), character_hash, now()],
            )
            .await
            .map_err(query_err(op))?;
        let row = rows
            .next()
            .await
            .map_err(query_err(op))?
            .ok_or_else(|| DatabaseError::Query(format!("{op}: insert returned no row")))?;
        ConversationHandle {
            id: row.get(0).map_err(row_err)?,
            secret: get_text(&row, 1)?,
        }
    };

    try_join_all(users.iter().map(|user| upsert_player(conn, handle.id, user)))
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: upsert player: {e}")))?;

    Ok(handle)
}

/// `None` when the conversation doesn't exist; `Some(None)` when it has no data yet.
async fn load_conversation_data(
    conn: &Connection,
    conversation_id: i64,
    op: &str,
) -> Result<Option<Option<Value>>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT data FROM Conversation WHERE id = ?1",
            params![conversation_id],
        )
        .await
        .map_err(query_err(op))?;

    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(
            get_opt_text(&row, 0)?
                .map(|raw| parse_json(&raw))
                .transpose()?,
        )),
        None => Ok(None),
    }
}

async fn merge_conversation_data(
    conn: &Connection,
    conversation_id: i64,
    patch: &Value,
) -> Result<(), DatabaseError> {
    let op = "Failed to set conversation data";
    let current = load_conversation_data(conn, conversation_id, op)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "conversation".into(),
            id: conversation_id.to_string(),
        })?;

    let merged = to_json(&merge_document(current, patch))?;
    conn.execute(
        "UPDATE Conversation SET data = ?1, updatedAt = ?2 WHERE id = ?3",
        params![merged, now(), conversation_id],
    )
    .await
    .map_err(query_err(op))?;
    Ok(())
}

/// Returns false when the conversation already uses `character_hash`.
async fn swap_conversation_character(
    conn: &Connection,
    conversation_id: i64,
    character_hash: &str,
) -> Result<bool, DatabaseError> {
    let op = "Failed to set conversation character";
    let mut rows = conn
        .query(
            "SELECT characterHash FROM Conversation WHERE id = ?1",
            params![conversation_id],
        )
        .await
        .map_err(query_err(op))?;
    let current = match rows.next().await.map_err(query_err(op))? {
        Some(row) => get_opt_text(&row, 0)?,
        None => {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: conversation_id.to_string(),
            });
        }
    };
    drop(rows);

    if current.as_deref() == Some(character_hash) {
        return Ok(false);
    }

    conn.execute(
        &format!(
            "DELETE FROM Message WHERE {}",
            CONVERSATION_MESSAGES.target_filter(1)
        ),
        params![conversation_id],
    )
    .await
    .map_err(query_err(op))?;

    conn.execute(
        "UPDATE Conversation SET characterHash = ?1, updatedAt = ?2 WHERE id = ?3",
        params![character_hash, now(), conversation_id],
    )
    .await
    .map_err(query_err(op))?;

    Ok(true)
}

async fn fetch_character(conn: &Connection, hash: &str) -> Result<Option<Character>, DatabaseError> {
    let op = "Failed to get character";
    let mut rows = conn
        .query(
            &format!(
                "SELECT {} FROM Character WHERE Character.hash = ?1 LIMIT 1",
                Table::Character.select_list()
            ),
            params![hash],
        )
        .await
        .map_err(query_err(op))?;

    match rows.next().await.map_err(query_err(op))? {
        Some(row) => row_to_character(&row, 0),
        None => Ok(None),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl StorageAdapter for LibSqlAdapter {
    async fn init(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Initialization(format!("enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn)
            .await
            .map_err(|e| DatabaseError::Initialization(e.to_string()))?;
        Ok(())
    }

    // ── Characters ──────────────────────────────────────────────────

    async fn get_character(&self, hash: &str) -> Result<Option<Character>, DatabaseError> {
        fetch_character(&*self.conn().await, hash).await
    }

    async fn create_character(
        &self,
        character: &CharacterDefinition,
    ) -> Result<Character, DatabaseError> {
        let op = "Failed to create character";
        let conn = self.conn().await;
        if let Some(existing) = fetch_character(&conn, &character.hash).await? {
            debug!(character_hash = %character.hash, "Character already stored");
            return Ok(existing);
        }

        let document = character.document();
        conn.execute(
            "INSERT INTO Character (hash, name, data, updatedAt) VALUES (?1, ?2, ?3, ?4)",
            params![
                character.hash.as_str(),
                character.name.as_str(),
                to_json(&document)?,
                now()
            ],
        )
        .await
        .map_err(query_err(op))?;

        debug!(character_hash = %character.hash, "Character inserted into DB");
        Ok(Character {
            hash: character.hash.clone(),
            name: character.name.clone(),
            data: document,
        })
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn create_conversation(
        &self,
        character_hash: &str,
        users: &[User],
        persistence_token: Option<&str>,
    ) -> Result<ConversationHandle, DatabaseError> {
        let op = "Failed to create conversation";
        let conn = self.conn().await;
        if fetch_character(&conn, character_hash).await?.is_none() {
            return Err(DatabaseError::Precondition(
                "Character must exist before creating conversation".into(),
            ));
        }

        let tx = begin(&conn, op).await?;
        let result =
            insert_conversation_with_players(&tx, character_hash, users, persistence_token).await;
        let handle = settle(tx, result, op).await?;

        debug!(
            conversation_id = handle.id,
            character_hash,
            users = users.len(),
            "Conversation created"
        );
        Ok(handle)
    }

    async fn get_conversation_by(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Option<ConversationView>, DatabaseError> {
        let op = "Failed to get conversation";
        if filter.is_empty() {
            return Err(DatabaseError::InvalidParameters(
                "No parameters provided to filter by".into(),
            ));
        }

        let mut clauses = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();
        if let Some(id) = filter.id() {
            values.push(libsql::Value::Integer(id));
            clauses.push(format!("Conversation.id = ?{}", values.len()));
        }
        if let Some(secret) = filter.secret() {
            values.push(libsql::Value::Text(secret.to_string()));
            clauses.push(format!("Conversation.secret = ?{}", values.len()));
        }
        if let Some(token) = filter.persistence_token() {
            values.push(libsql::Value::Text(token.to_string()));
            clauses.push(format!("Conversation.persistenceToken = ?{}", values.len()));
        }

        let sql = format!(
            "SELECT {}, {} FROM Conversation {} WHERE {} ORDER BY Conversation.id LIMIT 1",
            Table::Conversation.select_list(),
            Table::Character.select_list(),
            CONVERSATION_CHARACTER.left_join(),
            clauses.join(" OR "),
        );

        let conn = self.conn().await;
        let mut rows = conn.query(&sql, values).await.map_err(query_err(op))?;
        let Some(row) = rows.next().await.map_err(query_err(op))? else {
            return Ok(None);
        };

        let conversation = row_to_conversation(&row)?;
        let character = row_to_character(&row, Table::Conversation.columns().len() as i32)?;
        drop(rows);

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM Player WHERE {} ORDER BY Player.id",
                    Table::Player.select_list(),
                    CONVERSATION_PLAYERS.target_filter(1)
                ),
                params![conversation.id],
            )
            .await
            .map_err(query_err(op))?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            users.push(row_to_player(&row)?);
        }

        Ok(Some(ConversationView {
            conversation,
            users,
            character,
        }))
    }

    async fn set_conversation_data(
        &self,
        conversation_id: i64,
        patch: &Value,
    ) -> Result<(), DatabaseError> {
        let op = "Failed to set conversation data";
        let conn = self.conn().await;
        let tx = begin(&conn, op).await?;
        let result = merge_conversation_data(&tx, conversation_id, patch).await;
        settle(tx, result, op).await?;

        debug!(conversation_id, "Conversation data merged");
        Ok(())
    }

    async fn set_conversation_users(
        &self,
        conversation_id: i64,
        users: &[User],
    ) -> Result<(), DatabaseError> {
        let op = "Failed to set conversation users";
        let conn = self.conn().await;
        for user in users {
            upsert_player(&conn, conversation_id, user)
                .await
                .map_err(query_err(op))?;
        }

        debug!(conversation_id, users = users.len(), "Conversation users set");
        Ok(())
    }

    async fn set_conversation_character(
        &self,
        conversation_id: i64,
        character_hash: &str,
    ) -> Result<(), DatabaseError> {
        let op = "Failed to set conversation character";
        let conn = self.conn().await;
        let tx = begin(&conn, op).await?;
        let result = swap_conversation_character(&tx, conversation_id, character_hash).await;
        let swapped = settle(tx, result, op).await?;

        if swapped {
            debug!(conversation_id, character_hash, "Conversation character swapped, history cleared");
        }
        Ok(())
    }

    async fn finish_conversation(&self, conversation_id: i64) -> Result<(), DatabaseError> {
        let deleted = self
            .conn()
            .await
            .execute(
                "DELETE FROM Conversation WHERE id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(query_err("Failed to finish conversation"))?;

        debug!(conversation_id, deleted, "Conversation finished");
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn get_conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<Message>, DatabaseError> {
        let op = "Failed to get conversation messages";
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM Message WHERE {}
                     ORDER BY Message.createdAt DESC, Message.id DESC",
                    Table::Message.select_list(),
                    CONVERSATION_MESSAGES.target_filter(1)
                ),
                params![conversation_id],
            )
            .await
            .map_err(query_err(op))?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn add_message_to_conversation(
        &self,
        conversation_id: i64,
        message: &NewMessage,
    ) -> Result<(), DatabaseError> {
        let context = to_json(&message.context)?;
        self.conn()
            .await
            .execute(
                "INSERT INTO Message (content, role, senderId, conversationId, context, updatedAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.content.as_str(),
                    message.role.as_str(),
                    opt_int(message.sender_id),
                    conversation_id,
                    context,
                    now()
                ],
            )
            .await
            .map_err(query_err("Failed to add message to conversation"))?;

        debug!(conversation_id, role = %message.role, "Message added");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn test_db() -> LibSqlAdapter {
        LibSqlAdapter::new_memory().await.unwrap()
    }

    async fn seed_character(db: &LibSqlAdapter, hash: &str) {
        db.create_character(&CharacterDefinition::new(hash, format!("char-{hash}")))
            .await
            .unwrap();
    }

    async fn count(db: &LibSqlAdapter, sql: &str) -> i64 {
        let conn = db.conn().await;
        let mut rows = conn.query(sql, ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    // ── Helper tests ────────────────────────────────────────────────

    #[test]
    fn parse_datetime_formats() {
        let rfc = parse_datetime("2026-01-02T03:04:05+00:00").unwrap();
        let sqlite = parse_datetime("2026-01-02 03:04:05").unwrap();
        let fractional = parse_datetime("2026-01-02 03:04:05.000").unwrap();
        assert_eq!(rfc, sqlite);
        assert_eq!(sqlite, fractional);
        assert!(matches!(
            parse_datetime("garbage"),
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[test]
    fn merge_keeps_existing_keys() {
        let merged = merge_document(Some(json!({ "a": 1, "b": 1 })), &json!({ "b": 2, "c": 3 }));
        assert_eq!(merged, json!({ "a": 1, "b": 2, "c": 3 }));
    }

    #[test]
    fn merge_onto_missing_document() {
        assert_eq!(merge_document(None, &json!({ "a": 1 })), json!({ "a": 1 }));
        assert_eq!(
            merge_document(Some(json!("scalar")), &json!({ "a": 1 })),
            json!({ "a": 1 })
        );
    }

    #[test]
    fn non_object_patch_replaces() {
        assert_eq!(merge_document(Some(json!({ "a": 1 })), &json!([1, 2])), json!([1, 2]));
    }

    // ── Character tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn get_character_not_found() {
        let db = test_db().await;
        assert!(db.get_character("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_character_stores_document_without_hash() {
        let db = test_db().await;
        let def = CharacterDefinition::new("h1", "Grumpy")
            .with_trait("personality", json!({ "mood": "sour" }));

        let created = db.create_character(&def).await.unwrap();
        assert_eq!(created.hash, "h1");
        assert_eq!(
            created.data,
            json!({ "name": "Grumpy", "personality": { "mood": "sour" } })
        );

        let raw: String = {
            let conn = db.conn().await;
            let mut rows = conn
                .query("SELECT data FROM Character WHERE hash = 'h1'", ())
                .await
                .unwrap();
            rows.next().await.unwrap().unwrap().get(0).unwrap()
        };
        assert!(!raw.contains("\"hash\""));
    }

    // ── Conversation tests ──────────────────────────────────────────

    #[tokio::test]
    async fn secrets_are_unique_per_conversation() {
        let db = test_db().await;
        seed_character(&db, "c").await;

        let a = db.create_conversation("c", &[], None).await.unwrap();
        let b = db.create_conversation("c", &[], None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.secret, b.secret);
        assert_eq!(a.secret.len(), 32);
    }

    #[tokio::test]
    async fn lookup_by_secret_and_persistence_token() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let handle = db
            .create_conversation("c", &[User::new(1, "Ann")], Some("external-42"))
            .await
            .unwrap();

        let by_secret = db
            .get_conversation_by(&ConversationFilter::by_secret(handle.secret.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_secret.conversation.id, handle.id);

        let by_token = db
            .get_conversation_by(&ConversationFilter::by_persistence_token("external-42"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_token.conversation.id, handle.id);
        assert_eq!(
            by_token.conversation.persistence_token.as_deref(),
            Some("external-42")
        );

        let missing = db
            .get_conversation_by(&ConversationFilter::by_persistence_token("nope"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn filters_are_or_combined() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let handle = db.create_conversation("c", &[], None).await.unwrap();

        let filter = ConversationFilter {
            id: Some(9999),
            secret: Some(handle.secret.clone()),
            persistence_token: None,
        };
        let found = db.get_conversation_by(&filter).await.unwrap().unwrap();
        assert_eq!(found.conversation.id, handle.id);
    }

    #[tokio::test]
    async fn create_conversation_rolls_back_on_player_failure() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        db.conn()
            .await
            .execute(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON Player
                 WHEN NEW.name = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'rejected player'); END",
                (),
            )
            .await
            .unwrap();

        let err = db
            .create_conversation("c", &[User::new(1, "ok"), User::new(2, "boom")], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to create conversation"));

        assert_eq!(count(&db, "SELECT COUNT(*) FROM Conversation").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM Player").await, 0);
    }

    #[tokio::test]
    async fn unparseable_timestamp_is_an_error() {
        let db = test_db().await;
        db.conn()
            .await
            .execute(
                "INSERT INTO Player (id, name, updatedAt) VALUES (9, 'Zed', 'yesterday')",
                (),
            )
            .await
            .unwrap();

        let err = db.get_player(9).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
        assert!(err.to_string().contains("yesterday"));
    }

    #[tokio::test]
    async fn invalid_utf8_document_is_an_error() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let handle = db.create_conversation("c", &[], None).await.unwrap();
        db.conn()
            .await
            .execute(
                "UPDATE Conversation SET data = X'7BFF7D' WHERE id = ?1",
                params![handle.id],
            )
            .await
            .unwrap();

        let err = db
            .get_conversation_by(&ConversationFilter::by_id(handle.id))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn set_data_on_missing_conversation_is_not_found() {
        let db = test_db().await;
        let err = db
            .set_conversation_data(404, &json!({ "a": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "conversation"));
    }

    #[tokio::test]
    async fn character_swap_keeps_history_when_update_fails() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let handle = db.create_conversation("c", &[], None).await.unwrap();
        db.add_message_to_conversation(handle.id, &NewMessage::new("user", "hello"))
            .await
            .unwrap();

        // "ghost" is not a stored character, so the foreign key rejects the update.
        let err = db
            .set_conversation_character(handle.id, "ghost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to set conversation character"));

        let messages = db.get_conversation_messages(handle.id).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn character_swap_on_missing_conversation_is_not_found() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let err = db.set_conversation_character(77, "c").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn deleting_character_nulls_reference() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let handle = db.create_conversation("c", &[], None).await.unwrap();

        db.conn()
            .await
            .execute("DELETE FROM Character WHERE hash = 'c'", ())
            .await
            .unwrap();

        let view = db
            .get_conversation_by(&ConversationFilter::by_id(handle.id))
            .await
            .unwrap()
            .unwrap();
        assert!(view.character.is_none());
        assert!(view.conversation.character_hash.is_none());
    }

    #[tokio::test]
    async fn set_users_moves_players_between_conversations() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let first = db
            .create_conversation("c", &[User::new(1, "Ann")], None)
            .await
            .unwrap();
        let second = db.create_conversation("c", &[], None).await.unwrap();

        db.set_conversation_users(second.id, &[User::new(1, "Ann B."), User::new(2, "Bo")])
            .await
            .unwrap();

        let ann = db.get_player(1).await.unwrap().unwrap();
        assert_eq!(ann.conversation_id, Some(second.id));
        assert_eq!(ann.name, "Ann B.");

        let first_view = db
            .get_conversation_by(&ConversationFilter::by_id(first.id))
            .await
            .unwrap()
            .unwrap();
        assert!(first_view.users.is_empty());
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn message_fields_roundtrip() {
        let db = test_db().await;
        seed_character(&db, "c").await;
        let handle = db
            .create_conversation("c", &[User::new(5, "Sam")], None)
            .await
            .unwrap();

        db.add_message_to_conversation(
            handle.id,
            &NewMessage::new("user", "hi")
                .from_sender(5)
                .with_context("location", "tavern")
                .with_context("weather", "rain"),
        )
        .await
        .unwrap();
        db.add_message_to_conversation(handle.id, &NewMessage::new("narrator", "It rains."))
            .await
            .unwrap();

        let messages = db.get_conversation_messages(handle.id).await.unwrap();
        assert_eq!(messages.len(), 2);

        let narrator = &messages[0];
        assert_eq!(narrator.role, "narrator");
        assert_eq!(narrator.sender_id, None);
        assert!(narrator.context.is_empty());

        let user = &messages[1];
        assert_eq!(user.sender_id, Some(5));
        assert_eq!(
            user.context,
            vec![
                ContextEntry::new("location", "tavern"),
                ContextEntry::new("weather", "rain")
            ]
        );
        assert_eq!(user.conversation_id, handle.id);
    }

    #[tokio::test]
    async fn message_requires_existing_conversation() {
        let db = test_db().await;
        let err = db
            .add_message_to_conversation(12345, &NewMessage::new("user", "orphan"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to add message to conversation"));
    }

    // ── Migration tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn init_is_idempotent() {
        let db = test_db().await;
        db.init().await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), migrations::latest_version());
    }

    #[tokio::test]
    async fn init_failure_is_wrapped() {
        let db = LibSqlAdapter::open(":memory:", None).await.unwrap();
        // A foreign `_migrations` table without a version column.
        db.conn()
            .await
            .execute("CREATE TABLE _migrations (x TEXT)", ())
            .await
            .unwrap();

        let err = db.init().await.unwrap_err();
        assert!(matches!(err, DatabaseError::Initialization(_)));
        assert!(err.to_string().starts_with("Failed to initialize database"));
    }
}
