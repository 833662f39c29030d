//! Common fixtures for integration tests

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{date_time_ymd, CertificateParams, DnType, KeyPair};
use std::time::Duration;

use tether_agent::cli::config::{CollectorConfig, ShippingConfig};
use tether_agent::shipping::record::{LogLevel, LogRecord};

pub const LOGS_PATH: &str = "/api/logs";
pub const HEALTH_PATH: &str = "/health";

fn certificate(not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> String {
    let mut params = CertificateParams::new(vec!["collector-client.local".to_string()]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, "tether-integration");
    params.not_before = date_time_ymd(not_before.0, not_before.1, not_before.2);
    params.not_after = date_time_ymd(not_after.0, not_after.1, not_after.2);

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    STANDARD.encode(cert.der())
}

pub fn valid_certificate() -> String {
    certificate((2020, 1, 1), (2090, 1, 1))
}

pub fn expired_certificate() -> String {
    certificate((2019, 1, 1), (2020, 1, 1))
}

/// Collector settings pointing at `base_url` with fast retries
pub fn collector_config(base_url: &str, certificate: String) -> CollectorConfig {
    CollectorConfig {
        base_url: base_url.to_string(),
        logs_path: LOGS_PATH.to_string(),
        health_path: HEALTH_PATH.to_string(),
        certificate: Some(certificate),
        request_timeout_secs: 5,
        health_check_interval_secs: 60,
        retry_base_delay_ms: 10,
        ..CollectorConfig::default()
    }
}

pub fn shipping_config(batch_size: usize, interval_ms: u64) -> ShippingConfig {
    ShippingConfig {
        batch_size,
        processing_interval_ms: interval_ms,
        ..ShippingConfig::default()
    }
}

pub fn record(n: usize) -> LogRecord {
    LogRecord::new(LogLevel::Information, format!("event {n}")).with_id(format!("rec-{n}"))
}

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
