use crate::{error_chain_fmt, node_selector::NodeSelectorError};

#[derive(thiserror::Error)]
pub enum RequestExecutorError {
    #[error("Failed to retrieve database topology from all known nodes: {details}")]
    FirstTopologyUpdateFailed { details: String },
    #[error("Database '{0}' does not exist")]
    DatabaseDoesNotExist(String),
    #[error("{0}")]
    AllTopologyNodesDown(String),
    #[error("Node {url} is unavailable. Caused by: {reason}")]
    ServerDown { url: String, reason: String },
    #[error("Conflict reported by {url}: {message}")]
    Conflict { url: String, message: String },
    #[error("Bad request sent to {url}: {message}")]
    BadRequest { url: String, message: String },
    #[error("{0}")]
    AuthorizationFailed(String),
    #[error("{url} responded with status {status}: {message}")]
    ServerError {
        url: String,
        status: u16,
        message: String,
    },
    #[error("The request executor has been closed")]
    Disposed,
    #[error(transparent)]
    NodeSelector(#[from] NodeSelectorError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for RequestExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl RequestExecutorError {
    /// Rebuilds a bootstrap failure for one of the callers that waited on it.
    pub(crate) fn for_waiter(&self) -> Self {
        match self {
            Self::DatabaseDoesNotExist(database) => Self::DatabaseDoesNotExist(database.clone()),
            Self::FirstTopologyUpdateFailed { details } => Self::FirstTopologyUpdateFailed {
                details: details.clone(),
            },
            Self::Disposed => Self::Disposed,
            other => Self::FirstTopologyUpdateFailed {
                details: other.to_string(),
            },
        }
    }
}
