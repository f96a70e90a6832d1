use thiserror::Error;

/// Errors produced while connecting to or bootstrapping a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection string did not parse; fatal to the caller.
    #[error("invalid connection string: {0}")]
    BadConnstr(#[source] tokio_postgres::Error),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// A bootstrap script failed; later scripts of the sequence were not run.
    #[error("schema script #{index} for schema '{schema}' failed: {source}")]
    SchemaScript {
        schema: &'static str,
        index: usize,
        source: tokio_postgres::Error,
    },
}

impl From<bb8::RunError<tokio_postgres::Error>> for StoreError {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => StoreError::Postgres(e),
            bb8::RunError::TimedOut => StoreError::PoolTimeout,
        }
    }
}
