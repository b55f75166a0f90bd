//! Connection provider: turns a URL and optional token into a live handle.

use std::path::Path;

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::{ConfigError, DatabaseError, Error};

/// Where a connection string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Memory,
    /// Local database file path.
    Local(String),
    /// Remote libSQL server (Turso, sqld).
    Remote(String),
}

impl Location {
    /// Classify a connection string. `None` when it is blank.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        if url == ":memory:" || url == "file::memory:" {
            return Some(Location::Memory);
        }
        if let Some(path) = url.strip_prefix("file://") {
            return Some(Location::Local(path.to_string()));
        }
        if let Some(path) = url.strip_prefix("file:") {
            return Some(Location::Local(path.to_string()));
        }
        const REMOTE_SCHEMES: [&str; 5] = ["libsql://", "http://", "https://", "ws://", "wss://"];
        if REMOTE_SCHEMES.iter().any(|s| url.starts_with(s)) {
            return Some(Location::Remote(url.to_string()));
        }
        Some(Location::Local(url.to_string()))
    }
}

/// Open a database handle for `url`.
///
/// Blank URLs fail with a configuration error before anything touches the
/// driver. Remote reachability is not checked here; it surfaces on the
/// first query.
pub async fn open(
    url: &str,
    auth_token: Option<&SecretString>,
) -> Result<(LibSqlDatabase, Connection), Error> {
    let location = Location::parse(url).ok_or_else(|| ConfigError::MissingRequired {
        key: "connection_string".into(),
        hint: "Database URL was not passed".into(),
    })?;

    let db = match &location {
        Location::Memory => Builder::new_local(":memory:").build().await,
        Location::Local(path) => {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Connection(format!("Failed to create database directory: {e}"))
                })?;
            }
            Builder::new_local(path).build().await
        }
        Location::Remote(url) => {
            let token = auth_token
                .map(|t| t.expose_secret().to_string())
                .unwrap_or_default();
            Builder::new_remote(url.clone(), token).build().await
        }
    }
    .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

    if !matches!(location, Location::Remote(_)) {
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to enable foreign keys: {e}")))?;
    }

    match &location {
        Location::Memory => info!("In-memory database opened"),
        Location::Local(path) => info!(path = %path, "Database opened"),
        Location::Remote(url) => info!(url = %url, "Remote database opened"),
    }

    Ok((db, conn))
}
