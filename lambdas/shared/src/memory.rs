//! In-memory implementations of the I/O seams
//!
//! Compiled for unit tests and behind the `testing` feature; they record
//! everything they are handed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::classification::envelope::{ObjectStore, SubscriptionConfirmer};
use crate::directory::IntegrationSource;
use crate::errors::{Error, Result};
use crate::inventory::InventoryApi;
use crate::models::{DeleteEntry, Integration, Snapshot};
use crate::queue::{OutboundMessage, ScanQueue, ScanRequestStore};

/// Scan queue that keeps every accepted message
#[derive(Default)]
pub struct MemoryScanQueue {
    sent: Mutex<Vec<OutboundMessage>>,
    /// Batches whose total body size exceeds this are refused whole
    max_batch_bytes: Option<usize>,
    /// Number of upcoming entries to reject individually
    reject_next: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl MemoryScanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_bytes(max_batch_bytes: usize) -> Self {
        Self {
            max_batch_bytes: Some(max_batch_bytes),
            ..Self::default()
        }
    }

    pub fn reject_next_entries(&self, count: usize) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanQueue for MemoryScanQueue {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<Vec<String>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(limit) = self.max_batch_bytes {
            let total: usize = messages.iter().map(|m| m.body.len()).sum();
            if total > limit {
                return Err(Error::BatchTooLarge(format!("{} bytes > {}", total, limit)));
            }
        }

        let mut failed = Vec::new();
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        for m in messages {
            let reject = self
                .reject_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if reject {
                failed.push(m.id.clone());
            } else {
                sent.push(m.clone());
            }
        }
        Ok(failed)
    }
}

/// Side store backed by a map
#[derive(Default)]
pub struct MemoryRequestStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ScanRequestStore for MemoryRequestStore {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), body.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }
}

/// Inventory that records each call's batch
#[derive(Default)]
pub struct MemoryInventory {
    added: Mutex<Vec<Vec<Snapshot>>>,
    deleted: Mutex<Vec<Vec<DeleteEntry>>>,
    /// Remaining add calls to fail with a transient error
    fail_adds: AtomicUsize,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_adds(&self, count: usize) {
        self.fail_adds.store(count, Ordering::SeqCst);
    }

    /// Batches passed to `add_resources`, in call order
    pub fn add_batches(&self) -> Vec<Vec<Snapshot>> {
        self.added.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn added(&self) -> Vec<Snapshot> {
        self.add_batches().into_iter().flatten().collect()
    }

    pub fn deleted(&self) -> Vec<DeleteEntry> {
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InventoryApi for MemoryInventory {
    async fn add_resources(&self, batch: &[Snapshot]) -> Result<()> {
        let failing = self
            .fail_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Inventory("injected failure".to_string()));
        }
        self.added
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.to_vec());
        Ok(())
    }

    async fn delete_resources(&self, batch: &[DeleteEntry]) -> Result<()> {
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.to_vec());
        Ok(())
    }
}

/// Fixed integration list standing in for the integrations table
#[derive(Default)]
pub struct MemoryIntegrations {
    integrations: Mutex<Vec<Integration>>,
    calls: AtomicUsize,
}

impl MemoryIntegrations {
    pub fn new(integrations: Vec<Integration>) -> Self {
        Self {
            integrations: Mutex::new(integrations),
            calls: AtomicUsize::new(0),
        }
    }

    /// Onboard an account with default settings
    pub fn onboard(&self, account_id: &str) {
        self.integrations.lock().unwrap_or_else(|e| e.into_inner()).push(Integration {
            integration_id: format!("int-{}", account_id),
            account_id: account_id.to_string(),
            label: account_id.to_string(),
            scan_enabled: true,
            regions: vec![],
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationSource for MemoryIntegrations {
    async fn list_integrations(&self) -> Result<Vec<Integration>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.integrations.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Log objects keyed by bucket and key
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((bucket.to_string(), key.to_string()), data.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::Storage(format!("s3://{}/{} not found", bucket, key)))
    }
}

/// Records subscription URLs instead of visiting them
#[derive(Default)]
pub struct MemoryConfirmer {
    confirmed: Mutex<Vec<String>>,
}

impl MemoryConfirmer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmed(&self) -> Vec<String> {
        self.confirmed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SubscriptionConfirmer for MemoryConfirmer {
    async fn confirm(&self, _topic_arn: &str, subscribe_url: &str) -> Result<()> {
        self.confirmed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscribe_url.to_string());
        Ok(())
    }
}
