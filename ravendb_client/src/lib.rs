/*!
ravendb_client is a client library for the RavenDB document database.
It aims to compete with the existing libraries officially offered, but
using more rusty ways of doing things.

This library requires tokio and async, and uses the actor pattern to maintain
a single instance of the [`DocumentStore`] per cluster, as recommended by the
official libraries. This is designed to keep resource usage in your app to a minimum.

The [`DocumentStore`] hands out one [`RequestExecutor`](request_executor::RequestExecutor) per
database. The executor discovers the cluster topology, picks a node for every command according to
the configured [`ReadBalanceBehavior`](document_conventions::ReadBalanceBehavior), fails over to
other nodes when one goes down and caches responses. The
[`DatabaseChanges`](database_changes::DatabaseChanges) feed streams server notifications, which can
be used to keep that cache coherent.

# Example
```no_run
# tokio_test::block_on(async {
use ravendb_client::DocumentStore;

let document_store = DocumentStore::builder()
    .set_urls(&["http://localhost:8080"])
    .set_database_name("Northwind")
    .build()
    .unwrap();

document_store
    .listen_to_changes_and_update_the_cache(None)
    .await
    .unwrap();

let changes = document_store.changes(None).await.unwrap();
let _subscription = changes
    .for_documents_in_collection("Orders")
    .subscribe(|change: &ravendb_client::database_changes::DocumentChange| {
        println!("{:?} {}", change.change_type, change.id);
    });

document_store.close().await.unwrap();
# })
```
*/

mod document_store;

pub mod cache_eviction;
pub mod cluster_topology;
pub mod database_changes;
pub mod document_conventions;
pub mod http_cache;
pub mod node_selector;
pub mod raven_command;
pub mod request_executor;
pub mod server_node;
pub mod session_info;
pub mod topology;

pub use document_store::*;

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
