use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::instrument;

use crate::request_executor::RequestExecutor;

use super::{
    changes_notifications::{ChangeNotification, DocumentChange, IndexChange, OperationStatusChange},
    database_changes_actor::run_database_changes_actor,
    database_connection_state::{ConnectionRegistry, WatchCommand},
    ChangesConnector, ChangesObservable, ConnectionStatus, DatabaseChangesActor,
    DatabaseChangesError, DatabaseChangesMessage,
};

/// The changes feed of one database.
///
/// Cheap to clone, all clones share the same connection. The connection is opened right away
/// and kept open, reconnecting after failures, until [`close`](Self::close) is called.
#[derive(Clone)]
pub struct DatabaseChanges {
    database: String,
    registry: Arc<ConnectionRegistry>,
    sender: mpsc::UnboundedSender<DatabaseChangesMessage>,
    status: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for DatabaseChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseChanges")
            .field("database", &self.database)
            .field("status", &*self.status.borrow())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

impl DatabaseChanges {
    /// Starts the changes connection of `database`, on the node preferred by `request_executor`.
    pub fn new(
        request_executor: RequestExecutor,
        database: &str,
        connector: Arc<dyn ChangesConnector>,
        reconnect_delay: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (status_sender, status) = watch::channel(ConnectionStatus::Connecting);
        let registry = Arc::new(ConnectionRegistry::default());

        let actor = DatabaseChangesActor::new(
            receiver,
            connector,
            database.to_string(),
            reconnect_delay,
            registry.clone(),
            request_executor,
            status_sender,
        );
        tokio::spawn(run_database_changes_actor(actor));

        Self {
            database: database.to_string(),
            registry,
            sender,
            status,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    /// Waits until the connection is established.
    ///
    /// Returns the last connection error right away if the connection is currently faulted.
    #[instrument(level = "debug", skip(self), fields(database = %self.database))]
    pub async fn ensure_connected_now(&self) -> Result<(), DatabaseChangesError> {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Faulted(reason) => {
                    return Err(DatabaseChangesError::ConnectionFailed(reason))
                }
                ConnectionStatus::Closed => return Err(DatabaseChangesError::Closed),
                ConnectionStatus::Connecting => {}
            }
            status
                .changed()
                .await
                .map_err(|_| DatabaseChangesError::Closed)?;
        }
    }

    pub fn for_all_documents(&self) -> ChangesObservable<DocumentChange> {
        self.observable(
            "all-docs".to_string(),
            watch_command("watch-docs", "unwatch-docs", None),
            |_| true,
        )
    }

    pub fn for_document(&self, id: &str) -> ChangesObservable<DocumentChange> {
        let expected = id.to_string();
        self.observable(
            format!("docs/{}", id.to_lowercase()),
            watch_command("watch-doc", "unwatch-doc", Some(id.to_string())),
            move |change: &DocumentChange| change.id.eq_ignore_ascii_case(&expected),
        )
    }

    pub fn for_documents_starting_with(&self, prefix: &str) -> ChangesObservable<DocumentChange> {
        let expected = prefix.to_lowercase();
        self.observable(
            format!("prefixes/{}", expected),
            watch_command("watch-prefix", "unwatch-prefix", Some(prefix.to_string())),
            move |change: &DocumentChange| change.id.to_lowercase().starts_with(&expected),
        )
    }

    pub fn for_documents_in_collection(
        &self,
        collection: &str,
    ) -> ChangesObservable<DocumentChange> {
        let expected = collection.to_string();
        self.observable(
            format!("collections/{}", collection.to_lowercase()),
            watch_command(
                "watch-collection",
                "unwatch-collection",
                Some(collection.to_string()),
            ),
            move |change: &DocumentChange| {
                change
                    .collection_name
                    .as_deref()
                    .map(|name| name.eq_ignore_ascii_case(&expected))
                    .unwrap_or(false)
            },
        )
    }

    pub fn for_index(&self, index_name: &str) -> ChangesObservable<IndexChange> {
        let expected = index_name.to_string();
        self.observable(
            format!("indexes/{}", index_name.to_lowercase()),
            watch_command("watch-index", "unwatch-index", Some(index_name.to_string())),
            move |change: &IndexChange| change.name.eq_ignore_ascii_case(&expected),
        )
    }

    pub fn for_all_indexes(&self) -> ChangesObservable<IndexChange> {
        self.observable(
            "all-indexes".to_string(),
            watch_command("watch-indexes", "unwatch-indexes", None),
            |_| true,
        )
    }

    pub fn for_operation_id(&self, operation_id: i64) -> ChangesObservable<OperationStatusChange> {
        self.observable(
            format!("operations/{}", operation_id),
            watch_command(
                "watch-operation",
                "unwatch-operation",
                Some(operation_id.to_string()),
            ),
            move |change: &OperationStatusChange| change.operation_id == operation_id,
        )
    }

    pub fn for_all_operations(&self) -> ChangesObservable<OperationStatusChange> {
        self.observable(
            "all-operations".to_string(),
            watch_command("watch-operations", "unwatch-operations", None),
            |_| true,
        )
    }

    fn observable<T: ChangeNotification>(
        &self,
        key: String,
        watch_command: WatchCommand,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> ChangesObservable<T> {
        ChangesObservable::new(
            key,
            watch_command,
            filter,
            self.registry.clone(),
            self.sender.clone(),
        )
    }

    /// Closes the connection. Existing subscriptions stay valid but receive nothing more.
    #[instrument(level = "debug", skip(self), fields(database = %self.database))]
    pub async fn close(&self) {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(DatabaseChangesMessage::Close { respond_to })
            .is_ok()
        {
            let _ = response.await;
        }
    }
}

fn watch_command(
    watch: &'static str,
    unwatch: &'static str,
    param: Option<String>,
) -> WatchCommand {
    WatchCommand {
        watch,
        unwatch,
        param,
    }
}
