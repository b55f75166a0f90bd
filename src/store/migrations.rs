//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS "Character" (
                hash TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                createdAt TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updatedAt TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS "Conversation" (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                secret TEXT NOT NULL UNIQUE DEFAULT (lower(hex(randomblob(16)))),
                persistenceToken TEXT,
                data TEXT,
                characterHash TEXT REFERENCES "Character"(hash)
                    ON DELETE SET NULL ON UPDATE CASCADE,
                createdAt TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updatedAt TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS "Player" (
                id INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                conversationId INTEGER REFERENCES "Conversation"(id)
                    ON DELETE SET NULL ON UPDATE CASCADE,
                createdAt TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updatedAt TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS "Message" (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                content TEXT NOT NULL,
                role TEXT NOT NULL,
                senderId INTEGER REFERENCES "Player"(id)
                    ON DELETE SET NULL ON UPDATE CASCADE,
                conversationId INTEGER NOT NULL REFERENCES "Conversation"(id)
                    ON DELETE CASCADE ON UPDATE CASCADE,
                context TEXT NOT NULL DEFAULT '[]',
                createdAt TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updatedAt TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "lookup_indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_player_conversation ON "Player"(conversationId);
            CREATE INDEX IF NOT EXISTS idx_message_conversation_created
                ON "Message"(conversationId, createdAt);
            CREATE INDEX IF NOT EXISTS idx_conversation_persistence_token
                ON "Conversation"(persistenceToken);
        "#,
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply every migration newer than the recorded version, in order.
///
/// Returns the schema version recorded once the run finishes.
pub async fn run_migrations(conn: &Connection) -> Result<i64, DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let from = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();

    for migration in &pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "Migration V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        record_version(conn, migration.version, migration.name).await?;
    }

    let version = current_version(conn).await?;
    tracing::info!(from, version, applied = pending.len(), "Database migrations complete");
    Ok(version)
}

/// Get the highest applied migration version, or 0 if none.
pub async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn record_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
