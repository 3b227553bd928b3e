use thiserror::Error;

/// SQLSTATEs a fresh transaction is expected to get past: serialization
/// failure, deadlock, lock timeout and statement timeout.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014"];

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("database error during {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subject execution failed: {0}")]
    Execution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CrawlError {
    pub fn database(context: &'static str, source: sqlx::Error) -> Self {
        CrawlError::Database { context, source }
    }

    pub fn invalid_url(url: &str, reason: impl ToString) -> Self {
        CrawlError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Any failure raised by the store rather than by the subject itself.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            CrawlError::Database { .. } | CrawlError::Migration(_)
        )
    }

    /// The database is unreachable; the worker cannot continue.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            CrawlError::Database { source, .. } => matches!(
                source,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            CrawlError::Migration(_) => true,
            _ => false,
        }
    }

    /// The transaction was rolled back by contention and can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            CrawlError::Database {
                source: sqlx::Error::Database(db),
                ..
            } => db
                .code()
                .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref())),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_socket_errors_are_connection_failures() {
        let timed_out = CrawlError::database("dequeue", sqlx::Error::PoolTimedOut);
        assert!(timed_out.is_connection_failure());
        assert!(!timed_out.is_transient());

        let io = CrawlError::database(
            "report subject",
            sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        );
        assert!(io.is_connection_failure());
        assert!(io.is_store_failure());
    }

    #[test]
    fn decode_errors_are_neither_transient_nor_connection_failures() {
        let missing = CrawlError::database("fetch subject", sqlx::Error::RowNotFound);
        assert!(!missing.is_connection_failure());
        assert!(!missing.is_transient());
        assert!(!CrawlError::Execution("timeout".into()).is_transient());
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
