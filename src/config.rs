//! Configuration types.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Environment variable holding the database URL.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// Environment variable holding the optional remote auth token.
pub const DATABASE_AUTH_TOKEN_ENV: &str = "DATABASE_AUTH_TOKEN";

/// Options recognized by the adapter constructor.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Database URL: `:memory:`, a `file:` URL or path, or a `libsql://` / `https://` remote.
    pub connection_string: String,
    /// Credential for remote databases. Ignored for local files.
    pub auth_token: Option<SecretString>,
}

impl AdapterOptions {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(SecretString::from(token.into()));
        self
    }

    /// Load options from `DATABASE_URL` and `DATABASE_AUTH_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load options through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let connection_string = lookup(DATABASE_URL_ENV)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(DATABASE_URL_ENV.to_string()))?;

        let auth_token = lookup(DATABASE_AUTH_TOKEN_ENV)
            .filter(|v| !v.is_empty())
            .map(SecretString::from);

        Ok(Self {
            connection_string,
            auth_token,
        })
    }
}
