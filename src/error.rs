use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the UDB core
#[derive(Error, Debug)]
pub enum UdbError {
    /// Field-level validation failure, rendered back into the submitted form
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Entity lookup failure
    #[error("{kind} #{id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Credential check failure
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed
    #[error("forbidden")]
    Forbidden,

    /// Too many requests within the rate-limit window
    #[error("rate limit exceeded")]
    RateLimited,

    /// Operation rejected because other live rows still reference the target
    #[error("{0}")]
    Referential(String),

    /// Unique constraint violation mapped to the offending field
    #[error("a record with the same `{field}` already exists")]
    Conflict { field: String },

    /// Corrupted state or a hook fixpoint that did not converge
    #[error("fatal: {0}")]
    Fatal(String),

    /// Configuration related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ConfigError> },

    /// Configuration file not found
    #[error("configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Credential hashing errors
    #[error("password hashing error: {0}")]
    PasswordHash(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UdbError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        UdbError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// HTTP status the external dispatcher should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            UdbError::Validation { .. } => 400,
            UdbError::Unauthorized => 401,
            UdbError::Forbidden => 403,
            UdbError::NotFound { .. } => 404,
            UdbError::Referential(_) | UdbError::Conflict { .. } => 409,
            UdbError::RateLimited => 429,
            _ => 500,
        }
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ConfigError {
    /// Configuration key that failed validation
    pub key: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result type for UDB operations
pub type Result<T> = std::result::Result<T, UdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(UdbError::validation("name", "empty").http_status(), 400);
        assert_eq!(UdbError::Unauthorized.http_status(), 401);
        assert_eq!(UdbError::Forbidden.http_status(), 403);
        assert_eq!(UdbError::NotFound { kind: "vrf", id: 1 }.http_status(), 404);
        assert_eq!(
            UdbError::Conflict {
                field: "username".into()
            }
            .http_status(),
            409
        );
        assert_eq!(UdbError::RateLimited.http_status(), 429);
        assert_eq!(UdbError::Fatal("loop".into()).http_status(), 500);
    }
}
