use std::{collections::HashMap, sync::Arc};

use reqwest::Url;
use tokio::sync::mpsc;
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    cache_eviction::CacheEvictionBridge,
    database_changes::{ChangesConnector, DatabaseChanges},
    document_conventions::DocumentConventions,
    request_executor::{RequestExecutor, RequestExecutorOptions},
    DocumentStoreError, DocumentStoreInitialConfiguration, DocumentStoreMessage,
    DocumentStoreState,
};

/// Owns, per database, one [`RequestExecutor`], one [`DatabaseChanges`] and optionally one
/// [`CacheEvictionBridge`], each created on first use.
pub struct DocumentStoreActor {
    cache_evictions: HashMap<String, CacheEvictionBridge>,
    changes: HashMap<String, DatabaseChanges>,
    changes_connector: Arc<dyn ChangesConnector>,
    conventions: DocumentConventions,
    database_name: Option<String>,
    initial_urls: Vec<Url>,
    receiver: mpsc::Receiver<DocumentStoreMessage>,
    request_executor_options: RequestExecutorOptions,
    request_executors: HashMap<String, RequestExecutor>,
    state: DocumentStoreState,
}

impl DocumentStoreActor {
    pub(crate) fn new(
        receiver: mpsc::Receiver<DocumentStoreMessage>,
        initial_config: DocumentStoreInitialConfiguration,
    ) -> Self {
        Self {
            cache_evictions: HashMap::default(),
            changes: HashMap::default(),
            changes_connector: initial_config.changes_connector,
            conventions: initial_config.conventions,
            database_name: initial_config.database_name,
            initial_urls: initial_config.initial_urls,
            receiver,
            request_executor_options: initial_config.request_executor_options,
            request_executors: HashMap::default(),
            state: DocumentStoreState::Initialized,
        }
    }

    /// Message handler for the DocumentStoreActor
    #[instrument(
        level = "debug",
        name = "DocumentStore Actor - Handle Message",
        skip(self),
        fields(correlation_id)
    )]
    async fn handle_message(&mut self, msg: DocumentStoreMessage) {
        // Apply a correlation id to all child spans of this message handler
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            DocumentStoreMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
            DocumentStoreMessage::GetChanges {
                database_name,
                respond_to,
            } => {
                let result = self.get_changes(database_name);
                let _ = respond_to.send(result);
            }
            DocumentStoreMessage::GetDatabase { respond_to } => {
                let _ = respond_to.send(self.database_name.clone());
            }
            DocumentStoreMessage::GetRequestExecutor {
                database_name,
                respond_to,
            } => {
                let result = self.get_request_executor(database_name);
                let _ = respond_to.send(result);
            }
            DocumentStoreMessage::ListenToChangesAndUpdateTheCache {
                database_name,
                respond_to,
            } => {
                let result = self.listen_to_changes_and_update_the_cache(database_name);
                let _ = respond_to.send(result);
            }
        }
    }

    fn resolve_database(&self, database: Option<String>) -> Result<String, DocumentStoreError> {
        if self.state == DocumentStoreState::Closed {
            return Err(DocumentStoreError::Closed);
        }
        database
            .or_else(|| self.database_name.clone())
            .ok_or(DocumentStoreError::NoDatabaseSpecified)
    }

    /// See doc comments for [`DocumentStore`](crate::DocumentStore::request_executor)
    #[instrument(level = "debug", skip(self))]
    fn get_request_executor(
        &mut self,
        database: Option<String>,
    ) -> Result<RequestExecutor, DocumentStoreError> {
        let database = self.resolve_database(database)?;

        if let Some(executor) = self.request_executors.get(&database) {
            return Ok(executor.clone());
        }

        let executor = if self.conventions.disable_topology_updates() {
            let url = self
                .initial_urls
                .first()
                .cloned()
                .ok_or(DocumentStoreError::MissingUrlsError)?;
            RequestExecutor::create_for_single_node(
                url,
                &database,
                self.conventions.clone(),
                self.request_executor_options.clone(),
            )?
        } else {
            RequestExecutor::create(
                self.initial_urls.clone(),
                &database,
                self.conventions.clone(),
                self.request_executor_options.clone(),
            )?
        };
        tracing::debug!(%database, "Created request executor");

        self.request_executors.insert(database, executor.clone());
        Ok(executor)
    }

    #[instrument(level = "debug", skip(self))]
    fn get_changes(
        &mut self,
        database: Option<String>,
    ) -> Result<DatabaseChanges, DocumentStoreError> {
        let database = self.resolve_database(database)?;

        if let Some(changes) = self.changes.get(&database) {
            return Ok(changes.clone());
        }

        let executor = self.get_request_executor(Some(database.clone()))?;
        let changes = DatabaseChanges::new(
            executor,
            &database,
            self.changes_connector.clone(),
            self.conventions.changes_reconnect_delay(),
        );

        self.changes.insert(database, changes.clone());
        Ok(changes)
    }

    /// Registers the bridge once per database. The connection is awaited by the caller, the
    /// bridge stays registered when it fails since the feed keeps reconnecting.
    #[instrument(level = "debug", skip(self))]
    fn listen_to_changes_and_update_the_cache(
        &mut self,
        database: Option<String>,
    ) -> Result<DatabaseChanges, DocumentStoreError> {
        let database = self.resolve_database(database)?;
        let changes = self.get_changes(Some(database.clone()))?;
        if self.cache_evictions.contains_key(&database) {
            return Ok(changes);
        }

        let cache = self.get_request_executor(Some(database.clone()))?.cache();
        let bridge = CacheEvictionBridge::new(&changes, cache);

        self.cache_evictions.insert(database, bridge);
        Ok(changes)
    }

    #[instrument(level = "debug", skip(self))]
    async fn close(&mut self) {
        if self.state == DocumentStoreState::Closed {
            return;
        }
        self.state = DocumentStoreState::Closed;

        for (_, bridge) in self.cache_evictions.drain() {
            bridge.close();
        }
        for (_, changes) in self.changes.drain() {
            changes.close().await;
        }
        for (_, executor) in self.request_executors.drain() {
            executor.close().await;
        }
        tracing::info!("Document store closed");
    }
}

#[instrument(level = "debug", name = "Running Document Store Actor", skip(actor))]
pub async fn run_document_store_actor(mut actor: DocumentStoreActor) {
    while let Some(msg) = actor.receiver.recv().await {
        actor.handle_message(msg).await;
    }

    // Every handle is gone, release the connections.
    actor.close().await;
}
