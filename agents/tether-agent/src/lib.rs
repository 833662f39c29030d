//! Tether Agent Library
//!
//! This crate provides resilient delivery of structured logs to a remote
//! collector: certificate-authenticated pooled connections with health
//! checks and retries, plus a background batch shipper.

pub mod cli;
pub mod connection;
pub mod error;
pub mod shipping;

// Re-exports for convenience
pub use cli::config::Config;
pub use connection::certificate::{CertificateAuthenticator, ClientCertificate};
pub use connection::client::{ClientOptions, ClientState, ResilientClient};
pub use connection::factory::{ConnectionFactory, ConnectionSettings, HttpConnectionFactory};
pub use error::{CertificateError, ClientError};
pub use shipping::record::{ExecutionContext, LogLevel, LogRecord, WorkflowContext};
pub use shipping::shipper::{BatchConfiguration, BatchShipper, LoggingStats, ShipperOptions};
pub use shipping::uploader::{HttpLogUploader, LogUploader};
