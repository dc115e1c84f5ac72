use std::{fs::File, io::Read, sync::Arc};

use reqwest::Url;
use tracing::instrument;

use crate::{
    database_changes::{ChangesConnector, WebSocketConnector},
    document_conventions::DocumentConventions,
    request_executor::{DnsOverrides, RequestExecutorOptions},
    DocumentStore, DocumentStoreError, DocumentStoreInitialConfiguration,
};

#[derive(Debug)]
pub struct DocumentStoreBuilder {
    changes_connector: Option<Arc<dyn ChangesConnector>>,
    client_certificate_path: Option<String>,
    conventions: DocumentConventions,
    database_name: Option<String>,
    dns_overrides: Option<DnsOverrides>,
    document_store_urls: Vec<String>,
    proxy_address: Option<String>,
}

impl DocumentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dns_overrides(mut self, overrides: DnsOverrides) -> Self {
        tracing::trace!("Adding to dns_overrides: {:?}", &overrides);
        self.dns_overrides = Some(overrides);
        self
    }

    pub fn set_client_certificate(mut self, certificate_path: &str) -> Self {
        self.client_certificate_path = Some(certificate_path.to_string());
        self
    }

    pub fn set_proxy_address(mut self, proxy_address: &str) -> Self {
        self.proxy_address = Some(proxy_address.to_string());
        self
    }

    pub fn set_urls<T>(mut self, urls: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for u in urls {
            self.document_store_urls.push(u.as_ref().to_string());
        }
        self
    }

    pub fn set_database_name(mut self, database_name: &str) -> Self {
        self.database_name = Some(database_name.to_string());
        self
    }

    pub fn set_conventions(mut self, conventions: DocumentConventions) -> Self {
        self.conventions = conventions;
        self
    }

    /// Replaces the websocket transport of the changes feed.
    pub fn set_changes_connector(mut self, connector: Arc<dyn ChangesConnector>) -> Self {
        self.changes_connector = Some(connector);
        self
    }

    /// Initializes a new [`DocumentStoreActor`](crate::DocumentStoreActor) and returns a handle
    /// to it.
    ///
    /// Each call to this will create a new [`DocumentStoreActor`](crate::DocumentStoreActor) and
    /// return a new handle to it. It is not recommended to create more that one per database
    /// cluster. This function is allowed to be called more than once so the builder can act as a
    /// template after being set up once.
    #[instrument(level = "debug", name = "Build DocumentStoreBuilder", skip(self))]
    pub fn build(&self) -> Result<DocumentStore, DocumentStoreError> {
        // Ensure DocumentStore URLs are valid and there is at least one
        if self.document_store_urls.is_empty() {
            tracing::error!(
                "No URLs were supplied and a document store can't exist without at least one"
            );
            return Err(DocumentStoreError::MissingUrlsError);
        }

        let initial_urls = validate_urls(
            self.document_store_urls.as_slice(),
            self.client_certificate_path.is_some(),
        )?;

        let (client_identity, websocket_connector) = match &self.client_certificate_path {
            Some(certpath) => {
                let pem = read_certificate(certpath)?;
                (
                    Some(load_identity(&pem)?),
                    WebSocketConnector::with_client_certificate(&pem)?,
                )
            }
            None => (None, WebSocketConnector::default()),
        };

        let initial_config = DocumentStoreInitialConfiguration {
            changes_connector: self
                .changes_connector
                .clone()
                .unwrap_or_else(|| Arc::new(websocket_connector)),
            conventions: self.conventions.clone(),
            database_name: self.database_name.clone(),
            initial_urls,
            request_executor_options: RequestExecutorOptions {
                client_identity,
                dns_overrides: self.dns_overrides.clone(),
                proxy_address: self.proxy_address.clone(),
            },
        };

        tracing::trace!("Initial Configuration: {:?}", &initial_config);

        Ok(DocumentStore::new(initial_config))
    }
}

impl Default for DocumentStoreBuilder {
    fn default() -> Self {
        Self {
            changes_connector: None,
            client_certificate_path: None,
            conventions: DocumentConventions::default(),
            database_name: None,
            dns_overrides: None,
            document_store_urls: Vec::new(),
            proxy_address: None,
        }
    }
}

/// Reads the PEM file holding the client certificate and its key.
fn read_certificate(certpath: &str) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(certpath)
        .map_err(|e| {
            let err = anyhow::anyhow!("Failed to open certificate file. Caused by: {}", e);
            tracing::error!("{}", &err);
            err
        })?
        .read_to_end(&mut buf)
        .map_err(|e| {
            let err = anyhow::anyhow!("File was opened but unable to read. Caused by: {}", e);
            tracing::error!("{}", err);
            err
        })?;
    Ok(buf)
}

fn load_identity(pem: &[u8]) -> anyhow::Result<reqwest::Identity> {
    reqwest::Identity::from_pem(pem).map_err(|e| {
        let err = anyhow::anyhow!("Invalid pem file. Caused by: {}", e);
        tracing::error!("{}", err);
        err
    })
}

/// Converts the provided URL strings to [`Url`]s, keeping their order and dropping duplicates.
///
/// Also ensures all provided URL strings use the same schema: https when a client certificate is
/// configured, http otherwise.
#[instrument(level = "debug", name = "Validate URLs")]
fn validate_urls<T: std::fmt::Debug>(urls: &[T], require_https: bool) -> anyhow::Result<Vec<Url>>
where
    T: AsRef<str>,
{
    let desired_scheme = if require_https { "https" } else { "http" };

    let mut clean_urls: Vec<Url> = Vec::with_capacity(urls.len());
    for url in urls {
        let url = Url::parse(url.as_ref())
            .map_err(|e| anyhow::anyhow!("Invalid url `{}`. Caused by: {}", url.as_ref(), e))?;
        if url.scheme() != desired_scheme {
            return Err(anyhow::anyhow!("Url does not have correct scheme: {}", url));
        }
        if !clean_urls.contains(&url) {
            clean_urls.push(url);
        }
    }

    Ok(clean_urls)
}
