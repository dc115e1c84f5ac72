use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::{
    database_changes::DatabaseChanges, request_executor::RequestExecutor, run_document_store_actor,
    DocumentStoreActor, DocumentStoreBuilder, DocumentStoreError,
    DocumentStoreInitialConfiguration, DocumentStoreMessage,
};

const DEFAULT_AGGRESSIVE_CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/**
This a handle to the actor.

Only one DocumentStoreActor should exist per database cluster when possible to reduce resource
usage. Cloning this handle is very cheap and will not instantiate a new actor in the background.
It is recommended to clone this handle to each component that needs to talk to the DocumentStoreActor.
When the last handle goes out of scope and it dropped, the backing actor closes every executor and
changes connection it created.

```no_run
# tokio_test::block_on(async {
use ravendb_client::DocumentStore;

let document_store = DocumentStore::builder()
    .set_urls(&["http://localhost:8080"])
    .set_database_name("Northwind")
    .build()
    .unwrap();
let executor = document_store.request_executor(None).await.unwrap();
println!("Preferred node: {:?}", executor.preferred_node().await);
# })
```
*/
#[derive(Clone, Debug)]
pub struct DocumentStore {
    sender: mpsc::Sender<DocumentStoreMessage>,
}

impl DocumentStore {
    pub fn builder() -> DocumentStoreBuilder {
        DocumentStoreBuilder::default()
    }

    // This is pub(crate) so only the builder can crank it out
    pub(crate) fn new(initial_config: DocumentStoreInitialConfiguration) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let actor = DocumentStoreActor::new(receiver, initial_config);
        tokio::spawn(run_document_store_actor(actor));

        Self { sender }
    }

    async fn ask<T>(
        &self,
        make_message: impl FnOnce(oneshot::Sender<T>) -> DocumentStoreMessage,
    ) -> Result<T, DocumentStoreError> {
        tracing::trace!("Sending message to actor");
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make_message(tx))
            .await
            .map_err(|_| DocumentStoreError::ActorUnavailable)?;

        tracing::trace!("Waiting for oneshot to return");
        rx.await.map_err(|_| DocumentStoreError::ActorUnavailable)
    }

    /// The default database of this store, if one was configured.
    pub async fn database(&self) -> Result<Option<String>, DocumentStoreError> {
        self.ask(|respond_to| DocumentStoreMessage::GetDatabase { respond_to })
            .await
    }

    /// Returns the executor of `database`, or of the default database when `None`.
    ///
    /// Executors are created on first request and shared afterwards.
    #[instrument(level = "debug", name = "Actor Handle - Get Request Executor", skip(self))]
    pub async fn request_executor(
        &self,
        database: Option<&str>,
    ) -> Result<RequestExecutor, DocumentStoreError> {
        let database_name = database.map(str::to_string);
        self.ask(|respond_to| DocumentStoreMessage::GetRequestExecutor {
            database_name,
            respond_to,
        })
        .await?
    }

    /// Returns the changes feed of `database`, or of the default database when `None`.
    #[instrument(level = "debug", name = "Actor Handle - Get Changes", skip(self))]
    pub async fn changes(
        &self,
        database: Option<&str>,
    ) -> Result<DatabaseChanges, DocumentStoreError> {
        let database_name = database.map(str::to_string);
        self.ask(|respond_to| DocumentStoreMessage::GetChanges {
            database_name,
            respond_to,
        })
        .await?
    }

    /// Invalidates the http cache of `database` whenever the server reports a document or index
    /// change, then waits for the changes connection. Calling it again for the same database
    /// only waits for the connection.
    #[instrument(
        level = "debug",
        name = "Actor Handle - Listen To Changes And Update The Cache",
        skip(self)
    )]
    pub async fn listen_to_changes_and_update_the_cache(
        &self,
        database: Option<&str>,
    ) -> Result<(), DocumentStoreError> {
        let database_name = database.map(str::to_string);
        let changes = self
            .ask(
                |respond_to| DocumentStoreMessage::ListenToChangesAndUpdateTheCache {
                    database_name,
                    respond_to,
                },
            )
            .await??;
        changes.ensure_connected_now().await?;
        Ok(())
    }

    /// Serves cached responses of `database` younger than `duration` without asking the server.
    ///
    /// The cache is invalidated through the changes feed, so this starts listening to it first.
    /// Returns the previous duration.
    #[instrument(level = "debug", name = "Actor Handle - Aggressively Cache For", skip(self))]
    pub async fn aggressively_cache_for(
        &self,
        duration: Duration,
        database: Option<&str>,
    ) -> Result<Option<Duration>, DocumentStoreError> {
        self.listen_to_changes_and_update_the_cache(database).await?;
        let executor = self.request_executor(database).await?;
        Ok(executor.set_aggressive_caching(Some(duration)))
    }

    /// [`aggressively_cache_for`](Self::aggressively_cache_for) a day.
    pub async fn aggressively_cache(
        &self,
        database: Option<&str>,
    ) -> Result<Option<Duration>, DocumentStoreError> {
        self.aggressively_cache_for(DEFAULT_AGGRESSIVE_CACHE_DURATION, database)
            .await
    }

    /// Every read of `database` goes to the server again. Returns the previous duration.
    #[instrument(level = "debug", name = "Actor Handle - Disable Aggressive Caching", skip(self))]
    pub async fn disable_aggressive_caching(
        &self,
        database: Option<&str>,
    ) -> Result<Option<Duration>, DocumentStoreError> {
        let executor = self.request_executor(database).await?;
        Ok(executor.set_aggressive_caching(None))
    }

    /// Closes every executor and changes connection of this store.
    #[instrument(level = "debug", name = "Actor Handle - Close", skip(self))]
    pub async fn close(&self) -> Result<(), DocumentStoreError> {
        self.ask(|respond_to| DocumentStoreMessage::Close { respond_to })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Url;
    use serde_json::json;
    use tokio_test::assert_ok;
    use wiremock::{
        matchers::{header, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        database_changes::{
            in_memory::{InMemoryConnector, UnresponsiveConnector},
            ChangesConnector,
        },
        document_conventions::DocumentConventions,
        raven_command::RavenCommand,
        server_node::ServerNode,
    };

    use super::*;

    #[derive(Debug, Default)]
    struct LoadUserCommand {
        result: Option<serde_json::Value>,
    }

    impl RavenCommand for LoadUserCommand {
        fn create_request(
            &self,
            client: &reqwest::Client,
            node: &ServerNode,
        ) -> anyhow::Result<reqwest::Request> {
            let url = Url::parse(&format!(
                "{}/databases/{}/docs?id=users/1",
                node.base_url(),
                node.database
            ))?;
            Ok(client.get(url).build()?)
        }

        fn set_response(
            &mut self,
            response: Option<&str>,
            _from_cache: bool,
        ) -> anyhow::Result<()> {
            self.result = response.map(serde_json::from_str).transpose()?;
            Ok(())
        }

        fn is_read_request(&self) -> bool {
            true
        }
    }

    fn single_node_store(connector: Arc<dyn ChangesConnector>) -> DocumentStore {
        single_node_store_at("http://localhost:8080", connector)
    }

    fn single_node_store_at(url: &str, connector: Arc<dyn ChangesConnector>) -> DocumentStore {
        DocumentStore::builder()
            .set_urls(&[url])
            .set_database_name("db")
            .set_conventions(
                DocumentConventions::default()
                    .with_disable_topology_updates(true)
                    .with_changes_reconnect_delay(Duration::from_millis(10)),
            )
            .set_changes_connector(connector)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn request_executor_is_created_once_per_database() {
        let (connector, _servers) = InMemoryConnector::new();
        let store = single_node_store(connector);

        let first = store.request_executor(None).await.unwrap();
        let again = store.request_executor(Some("db")).await.unwrap();
        let other = store.request_executor(Some("other")).await.unwrap();

        assert!(Arc::ptr_eq(&first.cache(), &again.cache()));
        assert!(!Arc::ptr_eq(&first.cache(), &other.cache()));
        assert_eq!(other.database(), Some("other"));
        assert_eq!(store.database().await.unwrap().as_deref(), Some("db"));
    }

    #[tokio::test]
    async fn missing_database_is_reported() {
        let store = DocumentStore::builder()
            .set_urls(&["http://localhost:8080"])
            .build()
            .unwrap();

        let result = store.request_executor(None).await;

        assert!(matches!(result, Err(DocumentStoreError::NoDatabaseSpecified)));
    }

    #[tokio::test]
    async fn listening_to_changes_is_idempotent_per_database() {
        let (connector, mut servers) = InMemoryConnector::new();
        let store = single_node_store(connector);

        assert_ok!(store.listen_to_changes_and_update_the_cache(None).await);
        assert_ok!(store.listen_to_changes_and_update_the_cache(Some("db")).await);
        let mut server = servers.recv().await.unwrap();
        server.next_command().await;
        server.next_command().await;

        assert!(
            tokio::time::timeout(Duration::from_millis(50), server.received.recv())
                .await
                .is_err()
        );
        assert!(servers.try_recv().is_err());
        assert!(store.changes(None).await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn listening_fails_when_the_changes_connection_cannot_be_opened() {
        let (connector, _servers) = InMemoryConnector::new();
        connector.fail_next(1);
        let store = DocumentStore::builder()
            .set_urls(&["http://localhost:8080"])
            .set_database_name("db")
            .set_conventions(
                DocumentConventions::default()
                    .with_disable_topology_updates(true)
                    .with_changes_reconnect_delay(Duration::from_secs(5)),
            )
            .set_changes_connector(connector)
            .build()
            .unwrap();

        let result = store.listen_to_changes_and_update_the_cache(None).await;

        assert!(matches!(result, Err(DocumentStoreError::Changes(_))));
    }

    #[tokio::test]
    async fn close_releases_everything_the_store_created() {
        let (connector, _servers) = InMemoryConnector::new();
        let store = single_node_store(connector);
        let executor = store.request_executor(None).await.unwrap();
        let changes = store.changes(None).await.unwrap();
        changes.ensure_connected_now().await.unwrap();

        store.close().await.unwrap();

        assert!(executor.is_disposed());
        assert!(!changes.is_connected());
        assert!(matches!(
            store.request_executor(None).await,
            Err(DocumentStoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn store_keeps_answering_while_the_changes_connection_is_pending() {
        let store = single_node_store(Arc::new(UnresponsiveConnector));
        let listening = tokio::spawn({
            let store = store.clone();
            async move { store.listen_to_changes_and_update_the_cache(None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let database = tokio::time::timeout(Duration::from_secs(1), store.database()).await;
        let executor =
            tokio::time::timeout(Duration::from_secs(1), store.request_executor(None)).await;
        let closed = tokio::time::timeout(Duration::from_secs(1), store.close()).await;

        assert_eq!(database.unwrap().unwrap().as_deref(), Some("db"));
        assert!(executor.unwrap().is_ok());
        assert!(closed.unwrap().is_ok());
        let listened = tokio::time::timeout(Duration::from_secs(1), listening)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(listened, Err(DocumentStoreError::Changes(_))));
    }

    #[tokio::test]
    async fn aggressive_caching_listens_to_changes_and_can_be_disabled() {
        let (connector, mut servers) = InMemoryConnector::new();
        let store = single_node_store(connector);

        let previous = store
            .aggressively_cache_for(Duration::from_secs(60), None)
            .await
            .unwrap();
        let mut server = servers.recv().await.unwrap();
        let mut watched = vec![server.next_command().await, server.next_command().await]
            .into_iter()
            .map(|command| command["Command"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        watched.sort();
        let executor = store.request_executor(None).await.unwrap();

        assert_eq!(previous, None);
        assert_eq!(watched, vec!["watch-docs", "watch-indexes"]);
        assert_eq!(executor.aggressive_caching(), Some(Duration::from_secs(60)));
        assert_eq!(
            store.disable_aggressive_caching(None).await.unwrap(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(executor.aggressive_caching(), None);
        assert_eq!(store.aggressively_cache(None).await.unwrap(), None);
        assert_eq!(
            executor.aggressive_caching(),
            Some(Duration::from_secs(24 * 60 * 60))
        );
    }

    #[tokio::test]
    async fn document_change_forces_the_next_aggressive_read_to_the_server() {
        // Arrange
        let http = MockServer::start().await;
        Mock::given(path("/databases/db/docs"))
            .and(header("If-None-Match", "\"A:1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&http)
            .await;
        Mock::given(path("/databases/db/docs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"A:1\"")
                    .set_body_json(json!({ "Name": "John" })),
            )
            .expect(1)
            .mount(&http)
            .await;
        let (connector, mut servers) = InMemoryConnector::new();
        let store = single_node_store_at(&http.uri(), connector);
        store
            .aggressively_cache_for(Duration::from_secs(60), None)
            .await
            .unwrap();
        let server = servers.recv().await.unwrap();
        let executor = store.request_executor(None).await.unwrap();

        let mut first = LoadUserCommand::default();
        executor.execute_command(&mut first, None).await.unwrap();
        let requests = executor.number_of_server_requests();
        let mut cached = LoadUserCommand::default();
        executor.execute_command(&mut cached, None).await.unwrap();
        let requests_before_change = executor.number_of_server_requests();

        // Act
        let put = json!({ "Type": "DocumentChange", "Value": { "Type": "Put", "Id": "users/1" } });
        server.push.send(put.to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.cache().generation() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let mut after_change = LoadUserCommand::default();
        executor.execute_command(&mut after_change, None).await.unwrap();

        // Assert
        assert_eq!(requests_before_change, requests);
        assert_eq!(executor.number_of_server_requests(), requests + 1);
        assert_eq!(cached.result, Some(json!({ "Name": "John" })));
        assert_eq!(after_change.result, Some(json!({ "Name": "John" })));
    }
}
