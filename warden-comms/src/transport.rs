//! The injectable transport seam under the HTTP client.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::HttpBody as _;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use hyper_rustls::HttpsConnector;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use webpki_roots::TLS_SERVER_ROOTS;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by a transport implementation.
///
/// The split matters to the request loop: connect-class failures back off
/// before retrying, exchange-class failures retry immediately.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be resolved or connected.
    #[error("connect failed: {reason}")]
    Connect {
        /// Additional context about the failure.
        reason: String,
    },

    /// The connection dropped while writing the request or reading the
    /// response.
    #[error("request exchange failed: {reason}")]
    Exchange {
        /// Additional context about the failure.
        reason: String,
    },

    /// The request could not be constructed.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Additional context about the failure.
        reason: String,
    },
}

impl TransportError {
    pub(crate) fn connect(reason: impl Into<String>) -> Self {
        Self::Connect {
            reason: reason.into(),
        }
    }

    pub(crate) fn exchange(reason: impl Into<String>) -> Self {
        Self::Exchange {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct WireResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl WireResponse {
    /// Creates a response from its parts.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` for a 200 response.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Returns `true` for the statuses that demand a token refresh.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// Returns the body decoded as UTF-8 (lossy).
    #[must_use]
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport capable of carrying one HTTP exchange.
///
/// Production uses [`HyperTransport`]; tests inject fakes here, exactly
/// where a socket factory would otherwise be swapped out.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and reads the full response.
    async fn send(&self, request: Request<Body>) -> TransportResult<WireResponse>;

    /// Sends the request, streaming the response body into `dst_path`.
    ///
    /// The default implementation buffers the body; implementations with
    /// access to the raw stream should override it.
    async fn send_to_file(
        &self,
        request: Request<Body>,
        dst_path: &Path,
    ) -> TransportResult<WireResponse> {
        let response = self.send(request).await?;
        tokio::fs::write(dst_path, &response.body)
            .await
            .map_err(|err| TransportError::exchange(format!("writing {}: {err}", dst_path.display())))?;
        Ok(WireResponse::new(response.status, Vec::new()))
    }
}

/// Trust store holding the bundled webpki authorities.
fn webpki_trust_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    let anchors = TLS_SERVER_ROOTS.iter().map(|root| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            root.subject,
            root.spki,
            root.name_constraints,
        )
    });
    store.add_trust_anchors(anchors);
    store
}

/// TCP/TLS transport backed by a shared `hyper` client.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperTransport {
    /// Builds the transport trusting the bundled webpki roots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trust_store(webpki_trust_store())
    }

    /// Builds the transport over a caller-supplied trust store.
    ///
    /// Deployments pinning a private manager CA (and tests standing up
    /// their own authority) inject it here instead of the webpki bundle.
    #[must_use]
    pub fn with_trust_store(trust: RootCertStore) -> Self {
        let tls = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(trust)
            .with_no_client_auth();
        Self::with_tls_config(tls)
    }

    /// Builds the transport over a fully custom TLS client configuration.
    #[must_use]
    pub fn with_tls_config(tls: ClientConfig) -> Self {
        let mut tcp = HttpConnector::new();
        // The connector also carries plain-TCP requests when the manager
        // endpoint is configured without TLS.
        tcp.enforce_http(false);

        Self {
            client: Client::builder().build(HttpsConnector::from((tcp, Arc::new(tls)))),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: &hyper::Error) -> TransportError {
    if err.is_connect() {
        TransportError::connect(err.to_string())
    } else {
        TransportError::exchange(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, request: Request<Body>) -> TransportResult<WireResponse> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| classify(&err))?;

        let status = response.status().as_u16();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| TransportError::exchange(err.to_string()))?;

        Ok(WireResponse::new(status, body.to_vec()))
    }

    async fn send_to_file(
        &self,
        request: Request<Body>,
        dst_path: &Path,
    ) -> TransportResult<WireResponse> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| classify(&err))?;

        let status = response.status().as_u16();
        let mut body = response.into_body();

        let mut file = tokio::fs::File::create(dst_path)
            .await
            .map_err(|err| TransportError::exchange(format!("creating {}: {err}", dst_path.display())))?;

        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|err| TransportError::exchange(err.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|err| TransportError::exchange(format!("writing {}: {err}", dst_path.display())))?;
        }
        file.flush()
            .await
            .map_err(|err| TransportError::exchange(err.to_string()))?;

        Ok(WireResponse::new(status, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_trust_store_is_not_empty() {
        assert!(!webpki_trust_store().is_empty());
    }

    #[test]
    fn accepts_a_caller_supplied_trust_store() {
        // A pinned-CA deployment swaps the webpki bundle out entirely.
        let _transport = HyperTransport::with_trust_store(RootCertStore::empty());
    }
}
