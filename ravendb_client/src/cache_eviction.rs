use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;

use crate::{
    database_changes::{
        ChangesObserver, ChangesSubscription, DatabaseChanges, DatabaseChangesError,
        DocumentChange, DocumentChangeType, IndexChange, IndexChangeType,
    },
    http_cache::HttpCache,
};

/// Invalidates a whole [`HttpCache`] whenever a document or index of the database changes.
#[derive(Debug)]
pub struct CacheEvictionBridge {
    subscriptions: Mutex<Vec<ChangesSubscription>>,
}

struct DocumentsObserver(Arc<HttpCache>);

impl ChangesObserver<DocumentChange> for DocumentsObserver {
    fn on_next(&self, change: &DocumentChange) {
        if matches!(
            change.change_type,
            DocumentChangeType::Put | DocumentChangeType::Delete
        ) {
            self.0.bump_generation();
        }
    }

    /// Changes may have been missed while the feed was down.
    fn on_error(&self, _error: &DatabaseChangesError) {
        self.0.bump_generation();
    }
}

impl CacheEvictionBridge {
    /// Subscribes to all document and index changes of `changes`.
    ///
    /// Does not wait for the connection, see [`DatabaseChanges::ensure_connected_now`].
    #[instrument(level = "debug", skip(changes, cache), fields(database = %changes.database()))]
    pub fn new(changes: &DatabaseChanges, cache: Arc<HttpCache>) -> Self {
        let documents = changes
            .for_all_documents()
            .subscribe(DocumentsObserver(cache.clone()));
        let indexes = changes
            .for_all_indexes()
            .subscribe(move |change: &IndexChange| {
                if matches!(
                    change.change_type,
                    IndexChangeType::BatchCompleted | IndexChangeType::IndexRemoved
                ) {
                    cache.bump_generation();
                }
            });

        Self {
            subscriptions: Mutex::new(vec![documents, indexes]),
        }
    }

    pub fn close(&self) {
        self.subscriptions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Url;
    use serde_json::json;

    use crate::{
        database_changes::in_memory::InMemoryConnector,
        document_conventions::DocumentConventions,
        request_executor::{RequestExecutor, RequestExecutorOptions},
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for_generation(cache: &HttpCache, expected: u64) {
        tokio::time::timeout(WAIT, async {
            while cache.generation() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn relevant_changes_invalidate_the_cache() {
        let (connector, mut servers) = InMemoryConnector::new();
        let executor = RequestExecutor::create_for_single_node(
            Url::parse("http://localhost:8080").unwrap(),
            "db",
            DocumentConventions::default(),
            RequestExecutorOptions::default(),
        )
        .unwrap();
        let changes = DatabaseChanges::new(executor, "db", connector, Duration::from_millis(10));
        let cache = Arc::new(HttpCache::new(1024));
        cache.set("GET /docs?id=users/1", Some("A:1".to_string()), Some("{}"));

        let bridge = CacheEvictionBridge::new(&changes, cache.clone());
        changes.ensure_connected_now().await.unwrap();
        let mut server = servers.recv().await.unwrap();
        let mut watched = vec![
            server.next_command().await["Command"].as_str().unwrap().to_string(),
            server.next_command().await["Command"].as_str().unwrap().to_string(),
        ];
        watched.sort();
        server
            .push
            .send(
                json!([
                    { "Type": "DocumentChange", "Value": { "Type": "Conflict", "Id": "users/1" } },
                    { "Type": "IndexChange", "Value": { "Type": "IndexAdded", "Name": "Users/ByName" } },
                    { "Type": "DocumentChange", "Value": { "Type": "Put", "Id": "users/1" } }
                ])
                .to_string(),
            )
            .unwrap();
        wait_for_generation(&cache, 1).await;
        server
            .push
            .send(
                json!({ "Type": "IndexChange", "Value": { "Type": "BatchCompleted", "Name": "Users/ByName" } })
                    .to_string(),
            )
            .unwrap();
        wait_for_generation(&cache, 2).await;

        assert_eq!(watched, vec!["watch-docs", "watch-indexes"]);
        assert!(
            cache
                .lookup("GET /docs?id=users/1")
                .unwrap()
                .might_have_been_modified
        );
        assert_eq!(cache.generation(), 2);

        bridge.close();
        let unwatched = [server.next_command().await, server.next_command().await];
        assert_eq!(unwatched[0]["Command"], "unwatch-docs");
        assert_eq!(unwatched[1]["Command"], "unwatch-indexes");
    }

    #[tokio::test]
    async fn lost_connection_invalidates_the_cache() {
        let (connector, mut servers) = InMemoryConnector::new();
        let executor = RequestExecutor::create_for_single_node(
            Url::parse("http://localhost:8080").unwrap(),
            "db",
            DocumentConventions::default(),
            RequestExecutorOptions::default(),
        )
        .unwrap();
        let changes = DatabaseChanges::new(executor, "db", connector, Duration::from_millis(10));
        let cache = Arc::new(HttpCache::new(1024));

        let _bridge = CacheEvictionBridge::new(&changes, cache.clone());
        changes.ensure_connected_now().await.unwrap();
        let server = servers.recv().await.unwrap();
        assert_eq!(cache.generation(), 0);

        drop(server);
        wait_for_generation(&cache, 1).await;

        changes.close().await;
    }
}
