//! Certificate Authentication
//!
//! Parses the client identity certificate and derives the authorization
//! header attached to every collector request.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::CertificateError;

/// A parsed and validated client certificate
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    der: Vec<u8>,
    subject: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl ClientCertificate {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// SHA-256 of the DER bytes, hex encoded
    pub fn thumbprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after < now
    }

    /// Bearer value carrying the exported public certificate bytes.
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", STANDARD.encode(&self.der))
    }

    pub fn authorization_header(&self) -> Result<HeaderValue, CertificateError> {
        let mut value = HeaderValue::from_str(&self.authorization_value())
            .map_err(|_| CertificateError::InvalidHeader)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Turns a base64 certificate blob into a [`ClientCertificate`]
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificateAuthenticator;

impl CertificateAuthenticator {
    pub fn new() -> Self {
        Self
    }

    /// Decode and validate a certificate against the current time
    pub fn authenticate(&self, encoded: &str) -> Result<ClientCertificate, CertificateError> {
        self.authenticate_at(encoded, Utc::now())
    }

    /// Decode and validate a certificate against `now`
    pub fn authenticate_at(
        &self,
        encoded: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientCertificate, CertificateError> {
        let der = STANDARD.decode(encoded.trim())?;

        let (not_before, not_after, subject) = {
            let (_, parsed) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| CertificateError::Parse(e.to_string()))?;
            let validity = parsed.validity();
            (
                to_utc(validity.not_before.timestamp())?,
                to_utc(validity.not_after.timestamp())?,
                parsed.subject().to_string(),
            )
        };

        if not_before > now {
            return Err(CertificateError::NotYetValid { not_before });
        }
        if not_after < now {
            return Err(CertificateError::Expired { not_after });
        }

        let certificate = ClientCertificate {
            der,
            subject,
            not_before,
            not_after,
        };

        info!(
            subject = %certificate.subject,
            not_after = %certificate.not_after,
            thumbprint = %certificate.thumbprint(),
            "Client certificate accepted"
        );

        Ok(certificate)
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| CertificateError::Parse(format!("validity timestamp out of range: {timestamp}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::encoded_certificate;
    use chrono::TimeZone;

    #[test]
    fn test_accepts_valid_certificate() {
        let encoded = encoded_certificate((2020, 1, 1), (2090, 1, 1));
        let cert = CertificateAuthenticator::new().authenticate(&encoded).unwrap();

        assert!(cert.subject().contains("tether-test"));
        assert_eq!(cert.not_after().format("%Y").to_string(), "2090");
        assert_eq!(cert.thumbprint().len(), 64);
    }

    #[test]
    fn test_authorization_value_carries_der() {
        let encoded = encoded_certificate((2020, 1, 1), (2090, 1, 1));
        let cert = CertificateAuthenticator::new().authenticate(&encoded).unwrap();

        assert_eq!(cert.authorization_value(), format!("Bearer {}", encoded));
        let header = cert.authorization_header().unwrap();
        assert!(header.is_sensitive());
    }

    #[test]
    fn test_rejects_expired_certificate() {
        let encoded = encoded_certificate((2019, 1, 1), (2020, 1, 1));
        let result = CertificateAuthenticator::new().authenticate(&encoded);
        assert!(matches!(result, Err(CertificateError::Expired { .. })));
    }

    #[test]
    fn test_rejects_not_yet_valid_certificate() {
        let encoded = encoded_certificate((2090, 1, 1), (2091, 1, 1));
        let result = CertificateAuthenticator::new().authenticate(&encoded);
        assert!(matches!(result, Err(CertificateError::NotYetValid { .. })));
    }

    #[test]
    fn test_validity_checked_against_given_time() {
        let encoded = encoded_certificate((2020, 1, 1), (2021, 1, 1));
        let inside = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        let cert = CertificateAuthenticator::new()
            .authenticate_at(&encoded, inside)
            .unwrap();

        assert!(!cert.is_expired_at(inside));
        assert!(cert.is_expired_at(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_rejects_bad_base64() {
        let result = CertificateAuthenticator::new().authenticate("not base64 !!");
        assert!(matches!(result, Err(CertificateError::Decode(_))));
    }

    #[test]
    fn test_rejects_non_certificate_bytes() {
        let result = CertificateAuthenticator::new().authenticate(&STANDARD.encode(b"hello"));
        assert!(matches!(result, Err(CertificateError::Parse(_))));
    }
}
