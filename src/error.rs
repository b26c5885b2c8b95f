//! Error types for jobq-rs.

use thiserror::Error;

use crate::model::{JobId, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("duplicate submission conflicts with in-flight job {existing}")]
    Conflict { existing: JobId },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Store-connectivity failures. Workers back off and retry these; every
    /// other error is final for the operation that raised it.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unavailable(_) => true,
            Error::Database(e) => is_connection_error(e),
            _ => false,
        }
    }
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLSTATE class 08 is connection exception; 57P01..57P03 are server
        // shutdown and startup.
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_transient() {
        assert!(Error::Unavailable("down".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(Error::Database(sqlx::Error::PoolClosed).is_transient());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(Error::Database(sqlx::Error::Io(reset)).is_transient());
    }

    #[test]
    fn query_and_protocol_errors_are_final() {
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!Error::Database(sqlx::Error::Protocol("bad message".into())).is_transient());
        assert!(!Error::Database(sqlx::Error::ColumnNotFound("status".into())).is_transient());
        assert!(!Error::NotFound(JobId::new()).is_transient());
        assert!(
            !Error::InvalidTransition {
                from: Status::Completed,
                to: Status::Failed,
            }
            .is_transient()
        );
    }
}
