//! Change dispatch: inventory deletes and delayed scan requests
//!
//! Deletions go straight to the inventory. Everything else becomes a
//! `ScanEntry`, grouped into one `ScanMsg` per distinct delay. Entries that
//! share a delay share a message even when unrelated.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, SQS_MAX_BATCH_ENTRIES, SQS_MAX_MESSAGE_BYTES};
use crate::errors::{Error, Result};
use crate::inventory::InventoryApi;
use crate::models::{DeleteEntry, LookupKeyMsg, ResourceChange, ScanEntry, ScanMsg};
use crate::queue::{lookup_key, OutboundMessage, ScanQueue, ScanRequestStore};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Counts from one dispatch, logged by the handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub deleted: usize,
    pub scan_entries: usize,
    pub messages: usize,
    /// Messages replaced by a lookup key
    pub indirected: usize,
}

/// Puts scan entries on the scan request queue
///
/// Shared by the change dispatcher and the poller's continuation path.
#[derive(Clone)]
pub struct ScanSubmitter {
    queue: Arc<dyn ScanQueue>,
    store: Arc<dyn ScanRequestStore>,
    max_message_bytes: usize,
    retry: RetryPolicy,
}

impl ScanSubmitter {
    pub fn new(queue: Arc<dyn ScanQueue>, store: Arc<dyn ScanRequestStore>, config: &Config) -> Self {
        Self {
            queue,
            store,
            max_message_bytes: config.max_message_bytes.min(SQS_MAX_MESSAGE_BYTES),
            retry: RetryPolicy::with_attempts(config.max_retry_attempts),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enqueue one message per delay group, ascending by delay.
    ///
    /// Returns (messages sent, messages indirected through the side store).
    pub async fn submit(&self, groups: BTreeMap<u32, Vec<ScanEntry>>) -> Result<(usize, usize)> {
        let mut messages = Vec::with_capacity(groups.len());
        let mut indirected = 0;

        for (delay, entries) in groups {
            if entries.is_empty() {
                continue;
            }
            let count = entries.len();
            let mut body = serde_json::to_string(&ScanMsg { entries })?;

            if body.len() > self.max_message_bytes {
                let key = lookup_key(&body);
                retry_with_backoff(&self.retry, "store scan request", || self.store.put(&key, &body)).await?;
                info!(lookup_key = %key, entries = count, bytes = body.len(), "Scan message stored for lookup");
                body = serde_json::to_string(&LookupKeyMsg { lookup_key: key })?;
                indirected += 1;
            }
            messages.push(OutboundMessage::new(body, delay));
        }

        let sent = messages.len();
        for batch in transport_batches(messages) {
            self.send_batch(batch).await?;
        }
        Ok((sent, indirected))
    }

    /// A batch refused whole is retried one message at a time
    async fn send_batch(&self, batch: Vec<OutboundMessage>) -> Result<()> {
        if batch.len() <= 1 {
            return self.send_with_retry(batch).await;
        }
        match self.send_with_retry(batch.clone()).await {
            Err(Error::BatchTooLarge(reason)) => {
                warn!(messages = batch.len(), reason = %reason, "Scan batch too large, sending individually");
                for message in batch {
                    self.send_with_retry(vec![message]).await?;
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Retries failed entries (and transient whole-call errors) with backoff
    async fn send_with_retry(&self, mut pending: Vec<OutboundMessage>) -> Result<()> {
        let mut attempt = 1;
        loop {
            let failed = match self.queue.send_batch(&pending).await {
                Ok(failed) if failed.is_empty() => return Ok(()),
                Ok(failed) => failed,
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(attempt = attempt, error = %e, "Scan batch send failed");
                    pause(self.retry.backoff(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            pending.retain(|m| failed.contains(&m.id));
            if attempt >= self.retry.max_attempts {
                return Err(Error::Queue(format!(
                    "{} scan messages still failing after {} attempts",
                    pending.len(),
                    attempt
                )));
            }
            warn!(attempt = attempt, failed = pending.len(), "Retrying failed scan messages");
            pause(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }
}

async fn pause(delay: std::time::Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Split into transport batches bounded by entry count and total bytes
fn transport_batches(messages: Vec<OutboundMessage>) -> Vec<Vec<OutboundMessage>> {
    let mut batches = Vec::new();
    let mut current: Vec<OutboundMessage> = Vec::new();
    let mut current_bytes = 0;

    for message in messages {
        let size = message.body.len();
        if !current.is_empty() && (current.len() == SQS_MAX_BATCH_ENTRIES || current_bytes + size > SQS_MAX_MESSAGE_BYTES) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(message);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Routes aggregated changes to inventory deletes and the scan queue
pub struct ChangeDispatcher {
    inventory: Arc<dyn InventoryApi>,
    submitter: ScanSubmitter,
    max_delete_batch: usize,
    retry: RetryPolicy,
}

impl ChangeDispatcher {
    pub fn new(inventory: Arc<dyn InventoryApi>, submitter: ScanSubmitter, config: &Config) -> Self {
        Self {
            inventory,
            submitter,
            max_delete_batch: config.max_delete_batch,
            retry: RetryPolicy::with_attempts(config.max_retry_attempts),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.submitter = self.submitter.with_retry(retry);
        self.retry = retry;
        self
    }

    pub async fn dispatch(&self, changes: Vec<ResourceChange>) -> Result<DispatchSummary> {
        let (deletes, scans): (Vec<ResourceChange>, Vec<ResourceChange>) = changes.into_iter().partition(|c| c.delete);

        // Checked before anything is sent so the invocation fails cleanly
        if deletes.len() > self.max_delete_batch {
            return Err(Error::DeleteBatchTooLarge {
                count: deletes.len(),
                limit: self.max_delete_batch,
            });
        }

        let mut summary = DispatchSummary::default();

        if !deletes.is_empty() {
            let entries: Vec<DeleteEntry> = deletes.iter().map(ResourceChange::to_delete_entry).collect();
            retry_with_backoff(&self.retry, "delete resources", || self.inventory.delete_resources(&entries)).await?;
            summary.deleted = entries.len();
            info!(count = entries.len(), "Deleted resources");
        }

        let mut groups: BTreeMap<u32, Vec<ScanEntry>> = BTreeMap::new();
        for change in &scans {
            groups.entry(change.delay).or_default().push(change.to_scan_entry());
        }
        summary.scan_entries = scans.len();

        let (messages, indirected) = self.submitter.submit(groups).await?;
        summary.messages = messages;
        summary.indirected = indirected;

        if messages > 0 {
            info!(
                entries = summary.scan_entries,
                messages = messages,
                indirected = indirected,
                "Enqueued scan requests"
            );
        }
        Ok(summary)
    }
}
