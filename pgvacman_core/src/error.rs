use std::fmt;

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// A failed statement, as reported by the server (or by a session double).
#[derive(Debug, Clone)]
pub struct DbError {
    pub code: Option<SqlState>,
    pub message: String,
}

impl DbError {
    pub fn new(code: Option<SqlState>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn with_code(code: SqlState, message: impl Into<String>) -> Self {
        Self::new(Some(code), message)
    }

    #[inline]
    pub fn is_code(&self, code: &SqlState) -> bool {
        self.code.as_ref() == Some(code)
    }

    #[inline]
    pub fn is_lock_not_available(&self) -> bool {
        self.is_code(&SqlState::LOCK_NOT_AVAILABLE)
    }

    #[inline]
    pub fn is_query_canceled(&self) -> bool {
        self.is_code(&SqlState::QUERY_CANCELED)
    }

    /// True when the server rejected the credentials, or demanded a password we didn't have.
    pub fn is_password_failure(&self) -> bool {
        self.is_code(&SqlState::INVALID_PASSWORD) || self.message.contains("password missing")
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DbError {}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => DbError::new(Some(db.code().clone()), db.message()),
            None => DbError::new(e.code().cloned(), e.to_string()),
        }
    }
}

/// Errors that terminate a run.
#[derive(Error, Debug)]
pub enum VacmanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unable to parse rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid {field} pattern in matchgroup {index}: {source}")]
    InvalidPattern {
        index: usize,
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("Ruleset {ruleset} has more than one rule with minrows {minrows}")]
    DuplicateThreshold { ruleset: String, minrows: u64 },

    #[error("Matchgroup {index} references undefined ruleset {ruleset}")]
    UnknownRuleset { index: usize, ruleset: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Password authentication failed: {0}")]
    PasswordAuthentication(DbError),

    #[error("Unable to connect: {0}")]
    Connection(DbError),

    #[error("Unable to read catalog: {0}")]
    Catalog(DbError),

    #[error("Database error on {relation}: {source}")]
    Statement {
        relation: String,
        #[source]
        source: DbError,
    },

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl VacmanError {
    pub fn statement(relation: &str, source: DbError) -> Self {
        VacmanError::Statement {
            relation: relation.to_string(),
            source,
        }
    }
}
