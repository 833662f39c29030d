//! Log Uploader
//!
//! Sends one batch of records to the collector.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::connection::client::ResilientClient;
use crate::error::ClientError;
use crate::shipping::record::LogRecord;

/// Destination for record batches
#[async_trait]
pub trait LogUploader: Send + Sync {
    /// Deliver the whole batch or fail it as a unit
    async fn upload(&self, batch: &[LogRecord]) -> Result<(), ClientError>;
}

/// Posts batches as a JSON array through the resilient client
pub struct HttpLogUploader {
    client: Arc<ResilientClient>,
    logs_path: String,
}

impl HttpLogUploader {
    pub fn new(client: Arc<ResilientClient>, logs_path: impl Into<String>) -> Self {
        Self {
            client,
            logs_path: logs_path.into(),
        }
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }
}

#[async_trait]
impl LogUploader for HttpLogUploader {
    async fn upload(&self, batch: &[LogRecord]) -> Result<(), ClientError> {
        let path = self.logs_path.as_str();
        self.client
            .execute_with_retry(|connection| async move {
                connection.post_json(path, batch).await
            })
            .await?;

        debug!(records = batch.len(), path, "Batch uploaded");
        Ok(())
    }
}
