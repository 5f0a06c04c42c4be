//! Resource pollers
//!
//! A `Poller` turns a scan request into snapshots for one resource type. Each
//! poller talks to a narrow provider trait (one per AWS service) so the
//! polling logic can be exercised without AWS.

pub mod cloudtrail;
pub mod dispatcher;
pub mod dynamodb;
pub mod ecs;
pub mod s3;
pub mod sqs;

use async_trait::async_trait;
use aws_config::SdkConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::models::{ResourceType, Snapshot};

pub use dispatcher::PollerDispatcher;

/// Account a poll runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollContext {
    pub account_id: String,
    pub integration_id: String,
}

/// Result of a whole-type poll; a token means more remain
#[derive(Debug, Clone, Default)]
pub struct PollPage {
    pub snapshots: Vec<Snapshot>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait Poller: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// `Ok(None)` when the resource no longer exists or cannot be described
    async fn poll_one(&self, ctx: &PollContext, region: &str, resource_id: &str) -> Result<Option<Snapshot>>;

    async fn poll_all(&self, ctx: &PollContext, regions: &[String], page_token: Option<&str>) -> Result<PollPage>;

    /// Whole-type polls of this type must see every region of the account
    fn account_wide(&self) -> bool {
        false
    }
}

/// Pollers by resource type, built once per process
#[derive(Default, Clone)]
pub struct PollerRegistry {
    pollers: HashMap<ResourceType, Arc<dyn Poller>>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, poller: Arc<dyn Poller>) -> Self {
        self.pollers.insert(poller.resource_type(), poller);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<Arc<dyn Poller>> {
        self.pollers.get(&resource_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Every AWS-backed poller, sharing one base SDK configuration
    pub fn aws(sdk: &SdkConfig) -> Self {
        Self::new()
            .register(Arc::new(s3::BucketPoller::new(Arc::new(s3::AwsBucketApi::new(sdk)))))
            .register(Arc::new(dynamodb::TablePoller::new(Arc::new(dynamodb::AwsTableApi::new(sdk)))))
            .register(Arc::new(cloudtrail::TrailPoller::new(Arc::new(cloudtrail::AwsTrailApi::new(sdk)))))
            .register(Arc::new(sqs::QueuePoller::new(Arc::new(sqs::AwsQueueApi::new(sdk)))))
            .register(Arc::new(ecs::ClusterPoller::new(Arc::new(ecs::AwsClusterApi::new(sdk)))))
    }
}

/// One page of a provider list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Call `fetch` with each continuation token until the listing is exhausted
pub async fn drain_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut token = None;
    loop {
        let page = fetch(token.clone()).await?;
        items.extend(page.items);
        match page.next {
            Some(next) if token.as_deref() == Some(next.as_str()) => {
                warn!(token = %next, "Provider returned the same page token twice, stopping");
                return Ok(items);
            }
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(items),
        }
    }
}

/// Snapshots keyed by id; a later snapshot for the same id replaces the earlier
#[derive(Debug, Default)]
pub struct SnapshotBatch {
    order: Vec<String>,
    by_id: HashMap<String, Snapshot>,
}

impl SnapshotBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        let id = snapshot.id().to_string();
        if self.by_id.insert(id.clone(), snapshot).is_some() {
            info!(resource_id = %id, "Duplicate snapshot in one pass, keeping the latest");
        } else {
            self.order.push(id);
        }
    }

    pub fn extend(&mut self, snapshots: impl IntoIterator<Item = Snapshot>) {
        for s in snapshots {
            self.push(s);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Snapshots in first-seen order
    pub fn into_vec(mut self) -> Vec<Snapshot> {
        self.order.iter().filter_map(|id| self.by_id.remove(id)).collect()
    }
}

/// Continuation token of region-spanning polls: `<region>:<provider token>`
pub(crate) fn region_token(region: &str, next: Option<&str>) -> String {
    format!("{}:{}", region, next.unwrap_or_default())
}

/// Index of the region to resume at and the provider token within it
pub(crate) fn resume_point(regions: &[String], token: Option<&str>) -> Result<(usize, Option<String>)> {
    let Some(token) = token else {
        return Ok((0, None));
    };
    let (region, inner) = token
        .split_once(':')
        .ok_or_else(|| Error::InvalidScan(format!("malformed page token {:?}", token)))?;
    let index = regions
        .iter()
        .position(|r| r == region)
        .ok_or_else(|| Error::InvalidScan(format!("page token names unscanned region {}", region)))?;
    Ok((index, Some(inner.to_string()).filter(|s| !s.is_empty())))
}

/// Per-region SDK clients built lazily from one base configuration
pub struct RegionalClients<C> {
    base: SdkConfig,
    build: fn(&SdkConfig, &str) -> C,
    clients: Mutex<HashMap<String, C>>,
}

impl<C: Clone> RegionalClients<C> {
    pub fn new(base: &SdkConfig, build: fn(&SdkConfig, &str) -> C) -> Self {
        Self {
            base: base.clone(),
            build,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, region: &str) -> C {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(region.to_string())
            .or_insert_with(|| (self.build)(&self.base, region))
            .clone()
    }
}

/// Log an enrichment failure and drop that field group
pub(crate) fn enrichment<T>(result: Result<T>, resource_id: &str, group: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(resource_id = %resource_id, group = group, error = %e, "Enrichment failed, omitting field group");
            None
        }
    }
}
