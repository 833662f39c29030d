//! Connection Factory
//!
//! Builds pooled HTTP transports bound to the collector, with the
//! certificate-derived authorization header installed on every request.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cli::config::CollectorConfig;
use crate::connection::certificate::{CertificateAuthenticator, ClientCertificate};
use crate::error::ClientError;

/// A transport bound to one collector base address
#[derive(Debug)]
pub struct Connection {
    client: reqwest::Client,
    base_url: String,
    created_at: Instant,
    lifetime: Duration,
    disposed: AtomicBool,
}

impl Connection {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a collector path
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Whether the pooled-connection lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.lifetime
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mark the connection unusable; later requests fail with [`ClientError::Disposed`]
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!(base_url = %self.base_url, "Connection disposed");
        }
    }

    /// POST a JSON body, treating any non-2xx status as a rejection
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let body = serde_json::to_vec(body)?;

        let response = self
            .client
            .post(self.url(path))
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(())
    }

    /// HEAD request with its own timeout, returning the status code
    pub async fn head(&self, path: &str, timeout: Duration) -> Result<u16, ClientError> {
        self.ensure_live()?;

        let request = self.client.head(self.url(path)).timeout(timeout).send();
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| self.transport_error(e))?;

        Ok(response.status().as_u16())
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    fn transport_error(&self, err: reqwest::Error) -> ClientError {
        let err = ClientError::from(err);
        if err.is_tls_failure() {
            warn!(
                base_url = %self.base_url,
                error = %err,
                "TLS validation failed, rejecting connection"
            );
        }
        err
    }
}

/// Builds connections to the collector
pub trait ConnectionFactory: Send + Sync {
    /// Build a new connection and the certificate it authenticates with.
    /// No network traffic happens here.
    fn create(&self) -> Result<(Connection, ClientCertificate), ClientError>;
}

/// Settings for [`HttpConnectionFactory`]
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub base_url: String,
    pub certificate: String,
    /// Caps idle pooled connections kept per host (reqwest
    /// `pool_max_idle_per_host`). Concurrent connections are not limited.
    pub max_connections_per_host: usize,
    pub pooled_connection_lifetime: Duration,
    pub pooled_connection_idle_timeout: Duration,
    pub request_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &CollectorConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            base_url: config.base_url.clone(),
            certificate: config.load_certificate()?,
            max_connections_per_host: config.max_connections_per_host,
            pooled_connection_lifetime: config.pooled_connection_lifetime(),
            pooled_connection_idle_timeout: config.pooled_connection_idle_timeout(),
            request_timeout: config.request_timeout(),
        })
    }
}

/// reqwest-backed connection factory
pub struct HttpConnectionFactory {
    settings: ConnectionSettings,
    authenticator: CertificateAuthenticator,
    create_count: AtomicUsize,
}

impl HttpConnectionFactory {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            authenticator: CertificateAuthenticator::new(),
            create_count: AtomicUsize::new(0),
        }
    }

    /// Number of times `create` has been invoked
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self) -> Result<(Connection, ClientCertificate), ClientError> {
        self.create_count.fetch_add(1, Ordering::SeqCst);

        let certificate = self.authenticator.authenticate(&self.settings.certificate)?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, certificate.authorization_header()?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Invalid server certificates are always rejected; no override exists.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(self.settings.request_timeout)
            .pool_max_idle_per_host(self.settings.max_connections_per_host)
            .pool_idle_timeout(Some(self.settings.pooled_connection_idle_timeout))
            .use_rustls_tls()
            .danger_accept_invalid_certs(false)
            .build()?;

        debug!(base_url = %self.settings.base_url, "Connection created");

        let connection = Connection {
            client,
            base_url: self.settings.base_url.clone(),
            created_at: Instant::now(),
            lifetime: self.settings.pooled_connection_lifetime,
            disposed: AtomicBool::new(false),
        };

        Ok((connection, certificate))
    }
}
