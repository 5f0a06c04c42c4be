//! Poller dispatcher: scan request queue messages to inventory snapshots

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{PollContext, PollerRegistry, SnapshotBatch};
use crate::config::Config;
use crate::directory::AccountDirectory;
use crate::dispatch::ScanSubmitter;
use crate::errors::{Error, Result};
use crate::inventory::InventoryApi;
use crate::models::{QueueBody, ResourceType, ScanEntry, ScanMsg, Snapshot};
use crate::queue::ScanRequestStore;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Counts from one polling invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub messages: usize,
    pub entries: usize,
    pub failed_entries: usize,
    pub snapshots: usize,
    pub continuations: usize,
}

pub struct PollerDispatcher {
    registry: PollerRegistry,
    inventory: Arc<dyn InventoryApi>,
    store: Arc<dyn ScanRequestStore>,
    submitter: ScanSubmitter,
    directory: Option<Arc<AccountDirectory>>,
    default_regions: Vec<String>,
    max_add_batch: usize,
    retry: RetryPolicy,
}

impl PollerDispatcher {
    pub fn new(
        registry: PollerRegistry,
        inventory: Arc<dyn InventoryApi>,
        store: Arc<dyn ScanRequestStore>,
        submitter: ScanSubmitter,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            inventory,
            store,
            submitter,
            directory: None,
            default_regions: config.scan_regions.clone(),
            max_add_batch: config.max_add_batch.max(1),
            retry: RetryPolicy::with_attempts(config.max_retry_attempts),
        }
    }

    /// Integrations with their own region list override the configured regions
    pub fn with_directory(mut self, directory: Arc<AccountDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.submitter = self.submitter.with_retry(retry);
        self.retry = retry;
        self
    }

    /// Poll and flush each message in turn, then enqueue continuations
    pub async fn handle_batch(&self, bodies: &[String]) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        let mut continuations = Vec::new();

        for body in bodies {
            let msg = match self.resolve(body).await {
                Ok(msg) => msg,
                Err(e @ Error::InvalidScan(_)) => {
                    warn!(error = %e, body = %body, "Dropping unreadable scan message");
                    continue;
                }
                Err(e) => return Err(e),
            };
            summary.messages += 1;
            let mut batch = SnapshotBatch::new();
            self.handle_message(msg, &mut batch, &mut continuations, &mut summary).await;

            // Each message's snapshots land before the next message is polled
            summary.snapshots += batch.len();
            self.flush(batch.into_vec()).await?;
        }

        if !continuations.is_empty() {
            summary.continuations = continuations.len();
            let groups = std::iter::once((0, continuations)).collect();
            self.submitter.submit(groups).await?;
            info!(count = summary.continuations, "Enqueued scan continuations");
        }

        info!(
            messages = summary.messages,
            entries = summary.entries,
            failed = summary.failed_entries,
            snapshots = summary.snapshots,
            "Polling complete"
        );
        Ok(summary)
    }

    /// Parse a queue body, following a lookup key through the side store
    pub async fn resolve(&self, body: &str) -> Result<ScanMsg> {
        let parsed: QueueBody =
            serde_json::from_str(body).map_err(|e| Error::InvalidScan(format!("unparseable scan message: {}", e)))?;

        match parsed {
            QueueBody::Scan(msg) => Ok(msg),
            QueueBody::Lookup(lookup) => {
                let key = lookup.lookup_key;
                let stored = retry_with_backoff(&self.retry, "get scan request", || self.store.get(&key))
                    .await?
                    .ok_or_else(|| Error::InvalidScan(format!("lookup key {} not found", key)))?;
                debug!(lookup_key = %key, "Resolved stored scan request");
                serde_json::from_str(&stored).map_err(|e| Error::InvalidScan(format!("stored scan request {}: {}", key, e)))
            }
        }
    }

    /// Poll one message's entries into `batch`. Entry failures are logged and skipped.
    pub async fn handle_message(
        &self,
        msg: ScanMsg,
        batch: &mut SnapshotBatch,
        continuations: &mut Vec<ScanEntry>,
        summary: &mut PollSummary,
    ) {
        for entry in msg.entries {
            summary.entries += 1;
            match self.poll_entry(&entry, batch).await {
                Ok(Some(token)) => continuations.push(ScanEntry {
                    next_page_token: Some(token),
                    ..entry
                }),
                Ok(None) => {}
                Err(e) => {
                    summary.failed_entries += 1;
                    warn!(
                        entry = %serde_json::to_string(&entry).unwrap_or_default(),
                        error = %e,
                        code = e.code(),
                        "Scan entry failed"
                    );
                }
            }
        }
    }

    /// Returns the continuation token when the poller stopped early
    async fn poll_entry(&self, entry: &ScanEntry, batch: &mut SnapshotBatch) -> Result<Option<String>> {
        let resource_type: ResourceType = entry.resource_type.parse()?;
        let poller = self
            .registry
            .get(resource_type)
            .ok_or_else(|| Error::UnknownResourceType(entry.resource_type.clone()))?;
        let ctx = PollContext {
            account_id: entry.aws_account_id.clone(),
            integration_id: entry.integration_id.clone(),
        };

        if let (Some(id), false) = (&entry.resource_id, entry.scan_all_resources) {
            let region = entry.region.as_deref().unwrap_or_default();
            match poller.poll_one(&ctx, region, id).await? {
                Some(snapshot) if snapshot.is_complete() => batch.push(snapshot),
                _ => info!(resource_id = %id, resource_type = %resource_type, "Resource not found"),
            }
            return Ok(None);
        }

        let regions = match &entry.region {
            Some(region) if !poller.account_wide() => vec![region.clone()],
            _ => self.regions_for(&entry.aws_account_id).await,
        };
        let page = poller.poll_all(&ctx, &regions, entry.next_page_token.as_deref()).await?;
        debug!(
            account_id = %ctx.account_id,
            resource_type = %resource_type,
            snapshots = page.snapshots.len(),
            "Polled resources"
        );
        batch.extend(page.snapshots.into_iter().filter(Snapshot::is_complete));
        Ok(page.next_page_token)
    }

    async fn regions_for(&self, account_id: &str) -> Vec<String> {
        let Some(directory) = &self.directory else {
            return self.default_regions.clone();
        };
        match directory.get(account_id).await {
            Ok(Some(integration)) if !integration.regions.is_empty() => integration.regions,
            Ok(_) => self.default_regions.clone(),
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Directory lookup failed, using configured regions");
                self.default_regions.clone()
            }
        }
    }

    /// Send snapshots to the inventory in bounded batches
    pub async fn flush(&self, snapshots: Vec<Snapshot>) -> Result<()> {
        for chunk in snapshots.chunks(self.max_add_batch) {
            retry_with_backoff(&self.retry, "add resources", || self.inventory.add_resources(chunk)).await?;
            debug!(count = chunk.len(), "Added resources");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::StaticSource;
    use crate::memory::{MemoryInventory, MemoryRequestStore, MemoryScanQueue};
    use crate::models::{LookupKeyMsg, ResourceHeader};
    use crate::polling::{PollPage, Poller};
    use crate::queue::lookup_key;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Buckets named after the region; pages once when asked to
    #[derive(Default)]
    struct StubPoller {
        paged: bool,
        seen_regions: Mutex<Vec<Vec<String>>>,
    }

    fn bucket(ctx: &PollContext, name: &str, region: &str) -> Snapshot {
        Snapshot::new(
            ResourceHeader::new(format!("arn:aws:s3:::{}", name), ResourceType::S3Bucket, &ctx.account_id, region),
            serde_json::json!({}),
        )
    }

    #[async_trait]
    impl Poller for StubPoller {
        fn resource_type(&self) -> ResourceType {
            ResourceType::S3Bucket
        }

        async fn poll_one(&self, ctx: &PollContext, region: &str, resource_id: &str) -> Result<Option<Snapshot>> {
            if resource_id.ends_with("gone") {
                return Ok(None);
            }
            let name = resource_id.trim_start_matches("arn:aws:s3:::");
            Ok(Some(bucket(ctx, name, region)))
        }

        async fn poll_all(&self, ctx: &PollContext, regions: &[String], page_token: Option<&str>) -> Result<PollPage> {
            self.seen_regions.lock().unwrap().push(regions.to_vec());
            let suffix = page_token.unwrap_or("first");
            Ok(PollPage {
                snapshots: regions.iter().map(|r| bucket(ctx, &format!("{}-{}", r, suffix), r)).collect(),
                next_page_token: (self.paged && page_token.is_none()).then(|| "p2".to_string()),
            })
        }
    }

    struct FailingPoller;

    #[async_trait]
    impl Poller for FailingPoller {
        fn resource_type(&self) -> ResourceType {
            ResourceType::DynamoDbTable
        }

        async fn poll_one(&self, _: &PollContext, _: &str, _: &str) -> Result<Option<Snapshot>> {
            Err(Error::Provider("AccessDenied".into()))
        }

        async fn poll_all(&self, _: &PollContext, _: &[String], _: Option<&str>) -> Result<PollPage> {
            Err(Error::Provider("AccessDenied".into()))
        }
    }

    struct Harness {
        inventory: Arc<MemoryInventory>,
        queue: Arc<MemoryScanQueue>,
        store: Arc<MemoryRequestStore>,
        stub: Arc<StubPoller>,
        dispatcher: PollerDispatcher,
    }

    fn harness(paged: bool, config: Config) -> Harness {
        let inventory = Arc::new(MemoryInventory::new());
        let queue = Arc::new(MemoryScanQueue::new());
        let store = Arc::new(MemoryRequestStore::new());
        let stub = Arc::new(StubPoller {
            paged,
            ..StubPoller::default()
        });
        let registry = PollerRegistry::new().register(stub.clone()).register(Arc::new(FailingPoller));
        let submitter = ScanSubmitter::new(queue.clone(), store.clone(), &config);
        let dispatcher = PollerDispatcher::new(registry, inventory.clone(), store.clone(), submitter, &config)
            .with_retry(RetryPolicy::immediate(2));
        Harness {
            inventory,
            queue,
            store,
            stub,
            dispatcher,
        }
    }

    fn config(regions: &[&str]) -> Config {
        Config {
            scan_regions: regions.iter().map(|r| r.to_string()).collect(),
            ..Config::default()
        }
    }

    fn entry(resource_type: &str, resource_id: Option<&str>, region: Option<&str>) -> ScanEntry {
        ScanEntry {
            aws_account_id: "123456789012".into(),
            integration_id: "int-123456789012".into(),
            region: region.map(str::to_string),
            resource_id: resource_id.map(str::to_string),
            resource_type: resource_type.into(),
            scan_all_resources: resource_id.is_none(),
            next_page_token: None,
        }
    }

    fn body(entries: Vec<ScanEntry>) -> String {
        serde_json::to_string(&ScanMsg { entries }).unwrap()
    }

    #[tokio::test]
    async fn test_entry_failures_are_isolated() {
        let h = harness(false, config(&["us-west-2"]));
        let msg = body(vec![
            entry("AWS.S3.Bucket", Some("arn:aws:s3:::panther"), Some("us-west-2")),
            entry("AWS.Nope.Thing", Some("x"), None),
            entry("AWS.DynamoDB.Table", None, Some("us-west-2")),
            entry("AWS.KMS.Key", None, None),
            entry("AWS.S3.Bucket", Some("arn:aws:s3:::gone"), None),
        ]);

        let summary = h.dispatcher.handle_batch(&[msg]).await.unwrap();
        assert_eq!(summary.entries, 5);
        assert_eq!(summary.failed_entries, 3);
        assert_eq!(summary.snapshots, 1);
        assert_eq!(h.inventory.added()[0].id(), "arn:aws:s3:::panther");
    }

    #[tokio::test]
    async fn test_scan_all_uses_configured_regions() {
        let h = harness(false, config(&["us-east-1", "eu-west-1"]));
        h.dispatcher
            .handle_batch(&[body(vec![entry("AWS.S3.Bucket", None, None)])])
            .await
            .unwrap();
        assert_eq!(h.stub.seen_regions.lock().unwrap()[0], vec!["us-east-1", "eu-west-1"]);
        assert_eq!(h.inventory.added().len(), 2);
    }

    #[tokio::test]
    async fn test_integration_regions_override() {
        let source = Arc::new(StaticSource::new(&["123456789012"]));
        source.integrations.lock().unwrap()[0].regions = vec!["ap-south-1".into()];
        let directory = Arc::new(AccountDirectory::new(source, Duration::from_secs(60)));

        let mut h = harness(false, config(&["us-east-1"]));
        h.dispatcher = h.dispatcher.with_directory(directory);
        h.dispatcher
            .handle_batch(&[body(vec![entry("AWS.S3.Bucket", None, None)])])
            .await
            .unwrap();
        assert_eq!(h.stub.seen_regions.lock().unwrap()[0], vec!["ap-south-1"]);
    }

    #[tokio::test]
    async fn test_lookup_key_indirection() {
        let h = harness(false, config(&["us-west-2"]));
        let stored = body(vec![entry("AWS.S3.Bucket", Some("arn:aws:s3:::big"), Some("us-west-2"))]);
        let key = lookup_key(&stored);
        h.store.put(&key, &stored).await.unwrap();

        let indirect = serde_json::to_string(&LookupKeyMsg { lookup_key: key }).unwrap();
        let missing = serde_json::to_string(&LookupKeyMsg {
            lookup_key: "0".repeat(64),
        })
        .unwrap();
        let summary = h.dispatcher.handle_batch(&[indirect, missing, "not json".into()]).await.unwrap();

        assert_eq!(summary.messages, 1);
        assert_eq!(h.inventory.added()[0].id(), "arn:aws:s3:::big");
    }

    #[tokio::test]
    async fn test_continuation_enqueued() {
        let h = harness(true, config(&["us-west-2"]));
        let summary = h
            .dispatcher
            .handle_batch(&[body(vec![entry("AWS.S3.Bucket", None, Some("us-west-2"))])])
            .await
            .unwrap();
        assert_eq!(summary.continuations, 1);

        let sent = h.queue.sent();
        assert_eq!(sent.len(), 1);
        let follow_up: ScanMsg = serde_json::from_str(&sent[0].body).unwrap();
        assert_eq!(follow_up.entries[0].next_page_token.as_deref(), Some("p2"));
        assert_eq!(follow_up.entries[0].region.as_deref(), Some("us-west-2"));

        // The follow-up finishes the listing
        let summary = h.dispatcher.handle_batch(&[sent[0].body.clone()]).await.unwrap();
        assert_eq!(summary.continuations, 0);
        assert_eq!(h.inventory.added().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_in_bounded_batches_with_retry() {
        let mut cfg = config(&["us-west-2"]);
        cfg.max_add_batch = 2;
        let h = harness(false, cfg);
        h.inventory.fail_next_adds(1);

        let entries = (0..5)
            .map(|i| entry("AWS.S3.Bucket", Some(&format!("arn:aws:s3:::b{}", i)), Some("us-west-2")))
            .collect();
        h.dispatcher.handle_batch(&[body(entries)]).await.unwrap();

        let sizes: Vec<usize> = h.inventory.add_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_flush_failure_aborts() {
        let h = harness(false, config(&["us-west-2"]));
        h.inventory.fail_next_adds(5);
        let result = h
            .dispatcher
            .handle_batch(&[body(vec![entry("AWS.S3.Bucket", Some("arn:aws:s3:::a"), None)])])
            .await;
        assert!(matches!(result, Err(Error::Inventory(_))));
    }

    #[tokio::test]
    async fn test_duplicate_snapshots_across_entries() {
        let h = harness(false, config(&["us-west-2"]));
        let summary = h
            .dispatcher
            .handle_batch(&[body(vec![
                entry("AWS.S3.Bucket", Some("arn:aws:s3:::dup"), Some("us-west-2")),
                entry("AWS.S3.Bucket", Some("arn:aws:s3:::dup"), Some("us-west-2")),
            ])])
            .await
            .unwrap();
        assert_eq!(summary.snapshots, 1);
        assert_eq!(h.inventory.added().len(), 1);
    }

    #[tokio::test]
    async fn test_each_message_flushed_before_the_next() {
        let h = harness(false, config(&["us-west-2"]));
        let result = h
            .dispatcher
            .handle_batch(&[
                body(vec![entry("AWS.S3.Bucket", Some("arn:aws:s3:::first"), Some("us-west-2"))]),
                body(vec![entry("AWS.S3.Bucket", Some("arn:aws:s3:::second"), Some("us-west-2"))]),
            ])
            .await
            .unwrap();
        assert_eq!(result.snapshots, 2);

        let batches: Vec<Vec<String>> = h
            .inventory
            .add_batches()
            .iter()
            .map(|b| b.iter().map(|s| s.id().to_string()).collect())
            .collect();
        assert_eq!(batches, vec![vec!["arn:aws:s3:::first"], vec!["arn:aws:s3:::second"]]);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_earlier_messages() {
        let h = harness(false, config(&["us-west-2"]));
        let first = body(vec![entry("AWS.S3.Bucket", Some("arn:aws:s3:::kept"), Some("us-west-2"))]);
        h.dispatcher.handle_batch(&[first]).await.unwrap();

        h.inventory.fail_next_adds(5);
        let second = body(vec![entry("AWS.S3.Bucket", Some("arn:aws:s3:::lost"), Some("us-west-2"))]);
        assert!(h.dispatcher.handle_batch(&[second]).await.is_err());
        assert_eq!(h.inventory.added().len(), 1);
    }

    /// Records the regions of each whole-type poll of trails
    #[derive(Default)]
    struct TrailRegions {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Poller for TrailRegions {
        fn resource_type(&self) -> ResourceType {
            ResourceType::CloudTrail
        }

        async fn poll_one(&self, _: &PollContext, _: &str, _: &str) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        async fn poll_all(&self, _: &PollContext, regions: &[String], _: Option<&str>) -> Result<PollPage> {
            self.seen.lock().unwrap().push(regions.to_vec());
            Ok(PollPage::default())
        }

        fn account_wide(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_account_wide_poller_ignores_entry_region() {
        let config = config(&["us-east-1", "us-west-2"]);
        let trails = Arc::new(TrailRegions::default());
        let registry = PollerRegistry::new().register(trails.clone());
        let store = Arc::new(MemoryRequestStore::new());
        let submitter = ScanSubmitter::new(Arc::new(MemoryScanQueue::new()), store.clone(), &config);
        let dispatcher = PollerDispatcher::new(registry, Arc::new(MemoryInventory::new()), store, submitter, &config);

        dispatcher
            .handle_batch(&[body(vec![entry("AWS.CloudTrail", None, Some("us-west-2"))])])
            .await
            .unwrap();
        assert_eq!(trails.seen.lock().unwrap()[0], vec!["us-east-1", "us-west-2"]);
    }
}
