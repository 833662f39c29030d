//! Error types
//!
//! Errors raised by the connection layer and the shipping pipeline, plus the
//! transient/fatal classification used by the retry policy.

use chrono::{DateTime, Utc};
use std::error::Error as StdError;

/// Message fragments that mark a transport failure as worth retrying.
const TRANSIENT_PATTERNS: &[&str] = &[
    "dns",
    "tls",
    "ssl",
    "socket",
    "certificate",
    "connection reset",
    "connection refused",
    "broken pipe",
    "timed out",
];

/// Failures while reading or validating the client identity certificate.
/// Never retried.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Certificate is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Certificate could not be parsed: {0}")]
    Parse(String),

    #[error("Certificate is not valid before {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },

    #[error("Certificate expired at {not_after}")]
    Expired { not_after: DateTime<Utc> },

    #[error("Certificate cannot be used as a header value")]
    InvalidHeader,
}

/// Errors surfaced by the resilient client and the log pipeline
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("Client has been disposed")]
    Disposed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Collector rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether retrying the failed operation has a reasonable chance to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || mentions_transient(e)
            }
            ClientError::Timeout(_) => true,
            ClientError::Certificate(_)
            | ClientError::Disposed
            | ClientError::InvalidConfig(_)
            | ClientError::Rejected { .. }
            | ClientError::Serialization(_) => false,
        }
    }

    /// Whether this is a TLS validation failure reported by the transport.
    pub fn is_tls_failure(&self) -> bool {
        match self {
            ClientError::Transport(e) => error_chain(e)
                .iter()
                .any(|m| m.contains("certificate") || m.contains("tls")),
            _ => false,
        }
    }
}

fn mentions_transient(err: &reqwest::Error) -> bool {
    error_chain(err)
        .iter()
        .any(|m| TRANSIENT_PATTERNS.iter().any(|p| m.contains(p)))
}

/// Lowercased messages of an error and all of its sources.
fn error_chain(err: &(dyn StdError + 'static)) -> Vec<String> {
    let mut messages = vec![err.to_string().to_lowercase()];
    let mut source = err.source();
    while let Some(inner) = source {
        messages.push(inner.to_string().to_lowercase());
        source = inner.source();
    }
    messages
}
