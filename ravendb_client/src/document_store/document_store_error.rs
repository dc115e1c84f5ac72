use crate::{
    database_changes::DatabaseChangesError, error_chain_fmt,
    request_executor::RequestExecutorError,
};

#[derive(thiserror::Error)]
pub enum DocumentStoreError {
    #[error("No URLs were supplied and a document store can't exist without at least one")]
    MissingUrlsError,
    #[error("No database was given and the document store has no default database")]
    NoDatabaseSpecified,
    #[error("The document store has been closed")]
    Closed,
    #[error("The document store actor is no longer running")]
    ActorUnavailable,
    #[error(transparent)]
    RequestExecutor(#[from] RequestExecutorError),
    #[error(transparent)]
    Changes(#[from] DatabaseChangesError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for DocumentStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
