use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::DatabaseChangesError;

/// Opens the full-duplex text connection the changes feed runs over.
#[async_trait]
pub trait ChangesConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ChangesConnection>, DatabaseChangesError>;
}

#[async_trait]
pub trait ChangesConnection: Send {
    async fn send(&mut self, message: String) -> Result<(), DatabaseChangesError>;

    /// Waits for the next text frame. `None` means the peer closed the connection.
    ///
    /// Must be cancel safe, it is polled inside `select!`.
    async fn receive(&mut self) -> Option<Result<String, DatabaseChangesError>>;

    async fn close(&mut self);
}

/// Connects over websockets, presenting the client certificate on `wss` urls when one is set.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector {
    tls: Option<Arc<ClientConfig>>,
}

impl WebSocketConnector {
    /// Builds a connector that authenticates with the certificate chain and private key in `pem`.
    pub fn with_client_certificate(pem: &[u8]) -> Result<Self, DatabaseChangesError> {
        let certificates = CertificateDer::pem_slice_iter(pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid certificate in pem file: {:?}", e))?;
        if certificates.is_empty() {
            return Err(anyhow::anyhow!("No certificate found in pem file").into());
        }
        let key = PrivateKeyDer::from_pem_slice(pem)
            .map_err(|e| anyhow::anyhow!("Invalid private key in pem file: {:?}", e))?;

        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("Unable to select tls protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(certificates, key)
        .context("Unable to use the client certificate")?;

        Ok(Self {
            tls: Some(Arc::new(config)),
        })
    }

    pub fn has_client_certificate(&self) -> bool {
        self.tls.is_some()
    }
}

#[async_trait]
impl ChangesConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ChangesConnection>, DatabaseChangesError> {
        let connector = self.tls.clone().map(Connector::Rustls);
        let (stream, response) =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
                .await?;
        tracing::debug!(status = %response.status(), "Changes websocket connected");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChangesConnection for WebSocketConnection {
    async fn send(&mut self, message: String) -> Result<(), DatabaseChangesError> {
        self.stream.send(Message::Text(message)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Option<Result<String, DatabaseChangesError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Server closed the changes websocket");
                    return None;
                }
                // Pings are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("Error while closing the changes websocket: {}", e);
        }
    }
}

/// Turns a node url into the changes endpoint of `database`, switching to the websocket scheme.
pub(crate) fn changes_url(node_url: &Url, database: &str) -> Result<Url, DatabaseChangesError> {
    let base = node_url.as_str().trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/databases/{}/changes", base, database))
        .map_err(|e| DatabaseChangesError::ConnectionFailed(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme).map_err(|_| {
        DatabaseChangesError::ConnectionFailed(format!(
            "Unable to use scheme {} for {}",
            scheme, url
        ))
    })?;
    Ok(url)
}
