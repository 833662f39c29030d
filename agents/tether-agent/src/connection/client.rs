//! Resilient Client
//!
//! Facade over the connection factory, health monitor and retry policy.
//! Reconnection is single-flight: concurrent callers that find the
//! connection unhealthy wait on one in-flight rebuild.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::cli::config::CollectorConfig;
use crate::connection::certificate::ClientCertificate;
use crate::connection::factory::{
    Connection, ConnectionFactory, ConnectionSettings, HttpConnectionFactory,
};
use crate::connection::health::HealthMonitor;
use crate::connection::retry::RetryPolicy;
use crate::error::ClientError;

/// Lifecycle of the client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection has been built yet
    Uninitialized,
    /// Connected and last known healthy
    Healthy,
    /// Connected but failing health checks
    Unhealthy,
    /// Disposed; every call fails
    Disposed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Uninitialized => write!(f, "Uninitialized"),
            ClientState::Healthy => write!(f, "Healthy"),
            ClientState::Unhealthy => write!(f, "Unhealthy"),
            ClientState::Disposed => write!(f, "Disposed"),
        }
    }
}

/// Tuning for [`ResilientClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub health_path: String,
    pub health_check_interval: Duration,
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
}

impl ClientOptions {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            health_path: config.health_path.clone(),
            health_check_interval: config.health_check_interval(),
            max_retry_attempts: config.max_retry_attempts,
            retry_base_delay: config.retry_base_delay(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            health_path: "/health".to_string(),
            health_check_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Connection data; only written under the state lock
#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<Connection>>,
    certificate: Option<ClientCertificate>,
    initialized: bool,
    healthy: bool,
}

/// Self-healing client for the collector
pub struct ResilientClient {
    factory: Arc<dyn ConnectionFactory>,
    health: HealthMonitor,
    retry: RetryPolicy,
    state: RwLock<ConnectionState>,
    reconnect_lock: Mutex<()>,
    disposed: AtomicBool,
    reconnects: AtomicU64,
}

impl ResilientClient {
    pub fn new(factory: Arc<dyn ConnectionFactory>, options: ClientOptions) -> Self {
        Self {
            factory,
            health: HealthMonitor::new(options.health_check_interval, options.health_path),
            retry: RetryPolicy::new(options.max_retry_attempts, options.retry_base_delay),
            state: RwLock::new(ConnectionState::default()),
            reconnect_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Build a client with an HTTP connection factory from collector config
    pub fn from_config(config: &CollectorConfig) -> Result<Self, ClientError> {
        let settings = ConnectionSettings::from_config(config)?;
        let factory = Arc::new(HttpConnectionFactory::new(settings));
        Ok(Self::new(factory, ClientOptions::from_config(config)))
    }

    pub fn state(&self) -> ClientState {
        if self.is_disposed() {
            return ClientState::Disposed;
        }
        let state = self.state.read();
        match (state.initialized, state.healthy) {
            (false, _) => ClientState::Uninitialized,
            (true, true) => ClientState::Healthy,
            (true, false) => ClientState::Unhealthy,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of reconnect sequences started
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Certificate of the current connection, if any
    pub fn certificate(&self) -> Option<ClientCertificate> {
        self.state.read().certificate.clone()
    }

    /// Current connection, even if it fails its cached health check.
    /// Builds one if none exists yet.
    pub async fn get_connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.ensure_not_disposed()?;

        let (connection, initialized) = {
            let state = self.state.read();
            (state.connection.clone(), state.initialized)
        };

        match connection {
            Some(connection) => {
                let healthy =
                    self.health
                        .check_cached(Some(&connection), initialized, self.is_disposed());
                if !healthy {
                    debug!("Handing out connection that failed its health check");
                    self.state.write().healthy = false;
                }
                Ok(connection)
            }
            None => self.get_healthy_connection().await,
        }
    }

    /// A connection that passes the cached health check, rebuilding it if needed
    pub async fn get_healthy_connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.ensure_not_disposed()?;
        if let Some(connection) = self.healthy_connection() {
            return Ok(connection);
        }

        let _guard = self.reconnect_lock.lock().await;

        // Another caller may have reconnected while we waited.
        self.ensure_not_disposed()?;
        if let Some(connection) = self.healthy_connection() {
            return Ok(connection);
        }

        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!("Connecting to collector");

        let factory = &self.factory;
        let result = self
            .retry
            .execute(move || std::future::ready(factory.create()))
            .await;

        match result {
            Ok((connection, certificate)) => {
                let connection = Arc::new(connection);
                let previous = {
                    let mut state = self.state.write();
                    let previous = state.connection.replace(Arc::clone(&connection));
                    state.certificate = Some(certificate);
                    state.initialized = true;
                    state.healthy = true;
                    previous
                };
                if let Some(previous) = previous {
                    previous.dispose();
                }
                self.health.record(true);
                info!(base_url = %connection.base_url(), "Collector connection ready");
                Ok(connection)
            }
            Err(e) => {
                self.state.write().healthy = false;
                self.health.record(false);
                error!(error = %e, "Failed to connect to collector");
                Err(e)
            }
        }
    }

    /// Run `operation` against a healthy connection with retries.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: F) -> Result<T, ClientError>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let this = self;
        let operation = &operation;
        let result = self
            .retry
            .execute(move || async move {
                let connection = this.get_healthy_connection().await?;
                operation(connection).await
            })
            .await;

        if result.is_ok() {
            self.mark_healthy();
        }
        result
    }

    /// Remote health check through the cache
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let connection = self.get_connection().await?;
        let healthy = self.health.check(&connection).await;
        self.state.write().healthy = healthy;
        Ok(healthy)
    }

    /// Drop the current connection; the next healthy request rebuilds it
    pub async fn force_reconnect(&self) {
        let _guard = self.reconnect_lock.lock().await;
        self.release_connection();
        info!("Collector connection released for reconnect");
    }

    /// Release the connection for good. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release_connection();
        info!("Resilient client disposed");
    }

    fn release_connection(&self) {
        let previous = {
            let mut state = self.state.write();
            state.initialized = false;
            state.healthy = false;
            state.certificate = None;
            state.connection.take()
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
        self.health.invalidate();
    }

    fn healthy_connection(&self) -> Option<Arc<Connection>> {
        let state = self.state.read();
        let connection = state.connection.as_ref()?;
        self.health
            .check_cached(Some(connection), state.initialized, self.is_disposed())
            .then(|| Arc::clone(connection))
    }

    fn mark_healthy(&self) {
        let mut state = self.state.write();
        let live = state
            .connection
            .as_ref()
            .is_some_and(|c| !c.is_disposed() && !c.is_expired());
        if state.initialized && live && !self.is_disposed() {
            state.healthy = true;
            self.health.record(true);
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.dispose();
    }
}
