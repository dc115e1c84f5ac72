use std::sync::Arc;

use reqwest::Url;
use tokio::sync::oneshot;

use crate::{
    database_changes::{ChangesConnector, DatabaseChanges},
    document_conventions::DocumentConventions,
    request_executor::{RequestExecutor, RequestExecutorOptions},
    DocumentStoreError,
};

#[derive(Debug)]
pub(crate) enum DocumentStoreMessage {
    Close {
        respond_to: oneshot::Sender<()>,
    },
    GetChanges {
        database_name: Option<String>,
        respond_to: oneshot::Sender<Result<DatabaseChanges, DocumentStoreError>>,
    },
    GetDatabase {
        respond_to: oneshot::Sender<Option<String>>,
    },
    GetRequestExecutor {
        database_name: Option<String>,
        respond_to: oneshot::Sender<Result<RequestExecutor, DocumentStoreError>>,
    },
    /// Keeps the http cache of the database coherent with the server's change feed. Answers
    /// with the feed before it is connected.
    ListenToChangesAndUpdateTheCache {
        database_name: Option<String>,
        respond_to: oneshot::Sender<Result<DatabaseChanges, DocumentStoreError>>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DocumentStoreState {
    /// [`DocumentStore`](crate::DocumentStore) was initialized but has since been closed.
    Closed,

    /// [`DocumentStore`](crate::DocumentStore) is initialized.
    Initialized,
}

/// Everything the builder hands over to a new [`DocumentStoreActor`](crate::DocumentStoreActor).
#[derive(Debug)]
pub struct DocumentStoreInitialConfiguration {
    pub(crate) changes_connector: Arc<dyn ChangesConnector>,
    pub(crate) conventions: DocumentConventions,
    pub(crate) database_name: Option<String>,
    pub(crate) initial_urls: Vec<Url>,
    pub(crate) request_executor_options: RequestExecutorOptions,
}
