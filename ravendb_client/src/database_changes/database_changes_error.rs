use crate::{error_chain_fmt, request_executor::RequestExecutorError};

#[derive(thiserror::Error)]
pub enum DatabaseChangesError {
    #[error("The changes connection has been closed")]
    Closed,
    #[error("Unable to connect to the changes endpoint: {0}")]
    ConnectionFailed(String),
    #[error("The changes connection was lost: {0}")]
    ConnectionLost(String),
    #[error("The server reported an error: {0}")]
    ServerError(String),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    RequestExecutor(#[from] RequestExecutorError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for DatabaseChangesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
