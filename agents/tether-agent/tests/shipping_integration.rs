//! Batch shipping end to end against a mock collector

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    collector_config, expired_certificate, record, shipping_config, valid_certificate, wait_until,
    LOGS_PATH,
};
use tether_agent::cli::config::ShippingConfig;
use tether_agent::connection::client::ResilientClient;
use tether_agent::shipping::record::LogRecord;
use tether_agent::shipping::shipper::BatchShipper;
use tether_agent::shipping::state::ShipperState;

fn shipper_for(server: &MockServer, certificate: String, shipping: ShippingConfig) -> BatchShipper {
    let collector = collector_config(&server.uri(), certificate);
    let client = Arc::new(ResilientClient::from_config(&collector).unwrap());
    BatchShipper::from_config(client, &collector, &shipping).unwrap()
}

async fn posted_batches(server: &MockServer) -> Vec<Vec<LogRecord>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == LOGS_PATH)
        .map(|request| request.body_json().unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_records_delivered_in_batches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let shipper = shipper_for(&server, valid_certificate(), shipping_config(100, 20));
    shipper.initialize().unwrap();

    for n in 0..250 {
        shipper.enqueue(record(n));
    }

    assert!(wait_until(Duration::from_secs(5), || shipper.stats().delivered_count == 250).await);
    shipper.shutdown().await;

    let batches = posted_batches(&server).await;
    let mut sizes: Vec<_> = batches.iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![50, 100, 100]);

    let ids: HashSet<_> = batches.into_iter().flatten().map(|r| r.id).collect();
    assert_eq!(ids.len(), 250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_collector_drops_after_record_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGS_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let shipper = shipper_for(&server, valid_certificate(), shipping_config(10, 20));
    shipper.initialize().unwrap();

    for n in 0..5 {
        shipper.enqueue(record(n));
    }

    assert!(wait_until(Duration::from_secs(5), || shipper.stats().dropped_count == 5).await);
    let stats = shipper.stats();
    assert_eq!(stats.queued_count, 0);
    assert_eq!(stats.retrying_count, 0);
    assert_eq!(stats.delivered_count, 0);

    shipper.shutdown().await;
}

#[tokio::test]
async fn test_expired_certificate_drops_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let shipper = shipper_for(&server, expired_certificate(), shipping_config(10, 10));
    shipper.initialize().unwrap();
    shipper.enqueue(record(1));

    assert!(wait_until(Duration::from_secs(5), || shipper.stats().dropped_count == 1).await);
    shipper.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_slow_uploads() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGS_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let shipper = shipper_for(&server, valid_certificate(), shipping_config(1, 10));
    shipper.initialize().unwrap();

    for n in 0..5 {
        shipper.enqueue(record(n));
    }
    assert!(wait_until(Duration::from_secs(2), || shipper.stats().pending_uploads == 5).await);

    let started = Instant::now();
    shipper.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let stats = shipper.stats();
    assert_eq!(stats.pending_uploads, 0);
    assert_eq!(stats.queued_count, 0);
    assert_eq!(stats.delivered_count, 5);
    assert_eq!(shipper.state(), ShipperState::Stopped);
}

#[tokio::test]
async fn test_shutdown_flushes_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    // The loop never wakes before shutdown.
    let shipper = shipper_for(&server, valid_certificate(), shipping_config(50, 60_000));
    shipper.initialize().unwrap();

    for n in 0..60 {
        shipper.enqueue(record(n));
    }
    shipper.shutdown().await;

    assert_eq!(shipper.stats().delivered_count, 60);
    assert_eq!(shipper.stats().queued_count, 0);
}

#[tokio::test]
async fn test_disabled_shipper_discards_records() {
    let server = MockServer::start().await;
    let shipping = ShippingConfig {
        enabled: false,
        ..shipping_config(10, 10)
    };
    let shipper = shipper_for(&server, valid_certificate(), shipping);

    // Never initialized, as the binary does when shipping is disabled.
    for n in 0..10 {
        shipper.enqueue(record(n));
    }
    assert_eq!(shipper.stats().queued_count, 0);
    assert_eq!(shipper.state(), ShipperState::NotStarted);
}
