//! Scan request queue transport
//!
//! The dispatcher hands `OutboundMessage`s to a `ScanQueue`; bodies too large
//! for the transport are parked in a `ScanRequestStore` under a content key.

use async_trait::async_trait;
use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
use aws_sdk_sqs::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::SQS_MAX_DELAY_SECONDS;
use crate::errors::{Error, Result};

/// One message to enqueue, with its delivery delay applied by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Unique within one batch
    pub id: String,
    pub body: String,
    pub delay_seconds: u32,
}

impl OutboundMessage {
    pub fn new(body: String, delay_seconds: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            body,
            delay_seconds,
        }
    }
}

#[async_trait]
pub trait ScanQueue: Send + Sync {
    /// Send one batch. Returns the ids of entries the transport rejected
    /// individually; `Error::BatchTooLarge` means the whole batch was refused.
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<String>>;
}

/// Side store for scan messages too large to inline
#[async_trait]
pub trait ScanRequestStore: Send + Sync {
    async fn put(&self, key: &str, body: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Content-derived key for a stored scan request
///
/// Uses SHA-256 so identical bodies share one stored item.
pub fn lookup_key(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// SQS-backed scan queue
pub struct SqsScanQueue {
    client: Client,
    queue_url: String,
}

impl SqsScanQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl ScanQueue for SqsScanQueue {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<String>> {
        if messages.is_empty() {
            return Ok(vec![]);
        }

        let entries = messages
            .iter()
            .map(|m| {
                SendMessageBatchRequestEntry::builder()
                    .id(&m.id)
                    .message_body(&m.body)
                    .delay_seconds(m.delay_seconds.min(SQS_MAX_DELAY_SECONDS) as i32)
                    .build()
                    .map_err(|e| Error::Queue(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| {
                let too_long = e
                    .as_service_error()
                    .map(|se| se.is_batch_request_too_long())
                    .unwrap_or(false);
                if too_long {
                    Error::BatchTooLarge(e.to_string())
                } else {
                    Error::Queue(e.to_string())
                }
            })?;

        let failed: Vec<String> = output.failed().iter().map(|f| f.id().to_string()).collect();
        debug!(
            sent = messages.len() - failed.len(),
            failed = failed.len(),
            "Sent scan request batch"
        );
        Ok(failed)
    }
}
