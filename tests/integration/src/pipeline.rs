//! End-to-end harness over the in-memory seams
//!
//! Wires an `EventProcessor` and a `PollerDispatcher` to one shared scan
//! queue, request store and inventory, with the real S3 bucket and CloudTrail
//! pollers reading from static listings.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use snapshot_core::memory::{
    MemoryConfirmer, MemoryIntegrations, MemoryInventory, MemoryObjectStore, MemoryRequestStore, MemoryScanQueue,
};
use serde_json::{json, Value};
use snapshot_core::polling::cloudtrail::{TrailApi, TrailInfo, TrailPoller, TrailStatus};
use snapshot_core::polling::s3::{BucketApi, BucketPoller, EncryptionRule, PublicAccessBlock};
use snapshot_core::polling::Page;
use snapshot_core::{
    AccountDirectory, ChangeDispatcher, ClassifierRegistry, Config, EnvelopeReader, EventProcessor, PollSummary,
    PollerDispatcher, PollerRegistry, ProcessSummary, Result, RetryPolicy, ScanSubmitter,
};

use crate::fixtures::ACCOUNT_ID;

/// Bucket listing served `page_size` names at a time
pub struct StaticBuckets {
    buckets: Mutex<BTreeMap<String, String>>,
    page_size: usize,
}

impl StaticBuckets {
    pub fn new(page_size: usize) -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn add(&self, bucket: &str, region: &str) {
        self.buckets
            .lock()
            .unwrap()
            .insert(bucket.to_string(), region.to_string());
    }

    pub fn remove(&self, bucket: &str) {
        self.buckets.lock().unwrap().remove(bucket);
    }
}

#[async_trait]
impl BucketApi for StaticBuckets {
    async fn list_buckets(&self, token: Option<String>) -> Result<Page<String>> {
        let names: Vec<String> = self.buckets.lock().unwrap().keys().cloned().collect();
        let start: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(names.len());
        let next = (end < names.len()).then(|| end.to_string());
        Ok(Page {
            items: names[start.min(end)..end].to_vec(),
            next,
        })
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>> {
        Ok(self.buckets.lock().unwrap().get(bucket).cloned())
    }

    async fn public_access_block(&self, _region: &str, _bucket: &str) -> Result<Option<PublicAccessBlock>> {
        Ok(Some(PublicAccessBlock {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: true,
            restrict_public_buckets: true,
        }))
    }

    async fn encryption(&self, _region: &str, _bucket: &str) -> Result<Vec<EncryptionRule>> {
        Ok(vec![EncryptionRule {
            sse_algorithm: "aws:kms".to_string(),
            kms_master_key_id: None,
            bucket_key_enabled: true,
        }])
    }

    async fn versioning(&self, _region: &str, _bucket: &str) -> Result<Option<String>> {
        Ok(Some("Enabled".to_string()))
    }

    async fn tags(&self, _region: &str, _bucket: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Trails by home region; every region also sees multi-region trails as shadows
#[derive(Default)]
pub struct StaticTrails {
    trails: Mutex<Vec<TrailInfo>>,
}

impl StaticTrails {
    pub fn add(&self, trail: TrailInfo) {
        self.trails.lock().unwrap().push(trail);
    }
}

#[async_trait]
impl TrailApi for StaticTrails {
    async fn describe_trails(&self, region: &str) -> Result<Vec<TrailInfo>> {
        Ok(self
            .trails
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.home_region == region || t.is_multi_region)
            .cloned()
            .collect())
    }

    async fn trail_status(&self, _region: &str, _arn: &str) -> Result<TrailStatus> {
        Ok(TrailStatus {
            is_logging: true,
            latest_delivery_error: None,
        })
    }

    async fn event_selectors(&self, _region: &str, _arn: &str) -> Result<Value> {
        Ok(json!({"basic": [], "advanced": []}))
    }

    async fn tags(&self, _region: &str, _arn: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

pub struct Pipeline {
    pub integrations: Arc<MemoryIntegrations>,
    pub objects: Arc<MemoryObjectStore>,
    pub confirmer: Arc<MemoryConfirmer>,
    pub queue: Arc<MemoryScanQueue>,
    pub store: Arc<MemoryRequestStore>,
    pub inventory: Arc<MemoryInventory>,
    pub buckets: Arc<StaticBuckets>,
    pub trails: Arc<StaticTrails>,
    pub processor: EventProcessor,
    pub poller: PollerDispatcher,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_queue(MemoryScanQueue::new(), Config::default())
    }

    /// Pipeline whose scan queue and config are supplied by the test
    pub fn with_queue(queue: MemoryScanQueue, config: Config) -> Self {
        let retry = RetryPolicy::immediate(2);
        let integrations = Arc::new(MemoryIntegrations::default());
        integrations.onboard(ACCOUNT_ID);
        let objects = Arc::new(MemoryObjectStore::new());
        let confirmer = Arc::new(MemoryConfirmer::new());
        let queue = Arc::new(queue);
        let store = Arc::new(MemoryRequestStore::new());
        let inventory = Arc::new(MemoryInventory::new());
        let buckets = Arc::new(StaticBuckets::new(2));
        let trails = Arc::new(StaticTrails::default());
        let directory = Arc::new(AccountDirectory::new(integrations.clone(), Duration::from_secs(60)));

        let dispatcher = ChangeDispatcher::new(
            inventory.clone(),
            ScanSubmitter::new(queue.clone(), store.clone(), &config),
            &config,
        )
        .with_retry(retry);
        let reader = EnvelopeReader::new(objects.clone(), confirmer.clone());
        let processor = EventProcessor::new(ClassifierRegistry::standard(), directory.clone(), reader, dispatcher);

        let registry = PollerRegistry::new()
            .register(Arc::new(BucketPoller::new(buckets.clone())))
            .register(Arc::new(TrailPoller::new(trails.clone())));
        let poller = PollerDispatcher::new(
            registry,
            inventory.clone(),
            store.clone(),
            ScanSubmitter::new(queue.clone(), store.clone(), &config),
            &config,
        )
        .with_directory(directory)
        .with_retry(retry);

        Self {
            integrations,
            objects,
            confirmer,
            queue,
            store,
            inventory,
            buckets,
            trails,
            processor,
            poller,
        }
    }

    pub async fn ingest(&self, bodies: &[String]) -> Result<ProcessSummary> {
        self.processor.process_batch(bodies).await
    }

    /// Bodies on the scan queue, in send order
    pub fn scan_bodies(&self) -> Vec<String> {
        self.queue.sent().into_iter().map(|m| m.body).collect()
    }

    /// Feed every queued scan message after `skip` to the poller
    pub async fn poll_from(&self, skip: usize) -> Result<PollSummary> {
        let bodies: Vec<String> = self.scan_bodies().into_iter().skip(skip).collect();
        self.poller.handle_batch(&bodies).await
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
