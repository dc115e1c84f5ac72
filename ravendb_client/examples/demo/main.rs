use std::time::Duration;

use ravendb_client::{
    database_changes::DocumentChange,
    document_conventions::{DocumentConventions, ReadBalanceBehavior},
    raven_command::GetDatabaseTopologyCommand,
    session_info::SessionInfo,
    DocumentStoreBuilder,
};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let scheme: String = std::env::var("RAVEN_SCHEME").unwrap_or_else(|_| "http".to_string());
    let database = std::env::var("RAVEN_DATABASE").unwrap_or_else(|_| "Northwind".to_string());

    let mut document_store = DocumentStoreBuilder::new()
        .set_database_name(&database)
        .set_conventions(
            DocumentConventions::default().with_read_balance_behavior(ReadBalanceBehavior::RoundRobin),
        );
    if scheme == "https" {
        let url = std::env::var("RAVEN_URL")?;
        document_store = document_store
            .set_client_certificate("ravendb-client_dev_cert.pem")
            .set_urls(&[url]);
    } else {
        document_store = document_store.set_urls(&["http://localhost:8080"]);
    }

    let document_store = document_store.build()?;
    let executor = document_store.request_executor(None).await?;

    let mut command = GetDatabaseTopologyCommand::new(None, Some("demo"));
    executor
        .execute_command(&mut command, Some(&SessionInfo::new(1)))
        .await?;
    println!("{:#?}", command.result());

    document_store
        .listen_to_changes_and_update_the_cache(None)
        .await?;
    let changes = document_store.changes(None).await?;
    let _subscription = changes
        .for_all_documents()
        .subscribe(|change: &DocumentChange| {
            tracing::info!(id = %change.id, change_type = ?change.change_type, "Document changed");
        });

    tracing::info!("Watching document changes for 30 seconds");
    tokio::time::sleep(Duration::from_secs(30)).await;

    tracing::info!(
        requests = executor.number_of_server_requests(),
        "Closing document store"
    );
    document_store.close().await?;
    Ok(())
}

fn setup_tracing() {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().expect("Failed to set logger");
    // Set up tracing
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let formatting_layer = BunyanFormattingLayer::new("ravendb-rs-demo".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    set_global_default(subscriber).expect("Failed to set subscriber");
}
