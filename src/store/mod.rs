//! Persistence layer: libSQL-backed storage for characters, conversations and messages.

pub mod connection;
pub mod libsql_backend;
pub mod migrations;
pub(crate) mod relations;
pub(crate) mod schema;
pub mod traits;

pub use libsql_backend::LibSqlAdapter;
pub use traits::StorageAdapter;
