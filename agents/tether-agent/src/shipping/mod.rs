//! Shipping module
//!
//! Queues structured log records and ships them to the collector in batches,
//! retrying failed records a bounded number of times.

pub mod queue;
pub mod record;
pub mod shipper;
pub mod state;
pub mod tracker;
pub mod uploader;
