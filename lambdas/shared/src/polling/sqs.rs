//! SQS queue poller

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::error::ProvideErrorMetadata;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::{drain_pages, enrichment, Page, PollContext, PollPage, Poller, RegionalClients, SnapshotBatch};
use crate::arn::{parse, sqs_queue_arn_from_url};
use crate::errors::{Error, Result};
use crate::models::{ResourceHeader, ResourceType, Snapshot};

/// Attributes copied into the snapshot, when present
const SNAPSHOT_ATTRIBUTES: &[&str] = &[
    "QueueArn",
    "CreatedTimestamp",
    "LastModifiedTimestamp",
    "VisibilityTimeout",
    "MessageRetentionPeriod",
    "MaximumMessageSize",
    "DelaySeconds",
    "ReceiveMessageWaitTimeSeconds",
    "Policy",
    "RedrivePolicy",
    "KmsMasterKeyId",
    "SqsManagedSseEnabled",
    "FifoQueue",
    "ContentBasedDeduplication",
];

#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn list_queues(&self, region: &str, token: Option<String>) -> Result<Page<String>>;

    /// `Ok(None)` when the queue does not exist
    async fn attributes(&self, region: &str, url: &str) -> Result<Option<HashMap<String, String>>>;

    async fn tags(&self, region: &str, url: &str) -> Result<HashMap<String, String>>;
}

/// `arn:aws:sqs:region:account:name` to its queue URL
pub fn queue_url(arn: &str) -> Option<String> {
    let arn = parse(arn)?;
    if arn.service != "sqs" || arn.region.is_empty() || arn.account.is_empty() {
        return None;
    }
    Some(format!("https://sqs.{}.amazonaws.com/{}/{}", arn.region, arn.account, arn.resource))
}

pub struct QueuePoller {
    api: Arc<dyn QueueApi>,
}

impl QueuePoller {
    pub fn new(api: Arc<dyn QueueApi>) -> Self {
        Self { api }
    }

    async fn snapshot(&self, ctx: &PollContext, region: &str, url: &str) -> Option<Snapshot> {
        let attributes = match self.api.attributes(region, url).await {
            Ok(Some(attributes)) => attributes,
            Ok(None) => return None,
            Err(e) => {
                warn!(queue_url = %url, error = %e, "GetQueueAttributes failed");
                return None;
            }
        };

        let arn = attributes.get("QueueArn").cloned().or_else(|| sqs_queue_arn_from_url(url))?;
        let name = url.rsplit('/').next().unwrap_or_default();
        let mut header = ResourceHeader::new(&arn, ResourceType::SqsQueue, &ctx.account_id, region).with_name(name);

        let mut fields = Map::new();
        fields.insert("queueUrl".into(), Value::String(url.to_string()));
        for key in SNAPSHOT_ATTRIBUTES {
            if let Some(value) = attributes.get(*key) {
                fields.insert((*key).to_string(), Value::String(value.clone()));
            }
        }
        if let Some(tags) = enrichment(self.api.tags(region, url).await, &arn, "tags") {
            header.tags = tags;
        }

        Some(Snapshot::new(header, Value::Object(fields)))
    }
}

#[async_trait]
impl Poller for QueuePoller {
    fn resource_type(&self) -> ResourceType {
        ResourceType::SqsQueue
    }

    async fn poll_one(&self, ctx: &PollContext, region: &str, resource_id: &str) -> Result<Option<Snapshot>> {
        let url = if resource_id.starts_with("https://") {
            resource_id.to_string()
        } else {
            queue_url(resource_id).ok_or_else(|| Error::InvalidScan(format!("not a queue ARN: {}", resource_id)))?
        };
        let region = parse(resource_id).map(|a| a.region).filter(|r| !r.is_empty()).unwrap_or(region);
        Ok(self.snapshot(ctx, region, &url).await)
    }

    async fn poll_all(&self, ctx: &PollContext, regions: &[String], _page_token: Option<&str>) -> Result<PollPage> {
        let mut batch = SnapshotBatch::new();
        for region in regions {
            let urls = drain_pages(|token| self.api.list_queues(region, token)).await?;
            for url in urls {
                if let Some(snapshot) = self.snapshot(ctx, region, &url).await {
                    batch.push(snapshot);
                }
            }
        }
        Ok(PollPage {
            snapshots: batch.into_vec(),
            next_page_token: None,
        })
    }
}

pub struct AwsQueueApi {
    clients: RegionalClients<Client>,
}

impl AwsQueueApi {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self {
            clients: RegionalClients::new(sdk, |sdk, region| {
                let conf = aws_sdk_sqs::config::Builder::from(sdk)
                    .region(aws_sdk_sqs::config::Region::new(region.to_string()))
                    .build();
                Client::from_conf(conf)
            }),
        }
    }
}

#[async_trait]
impl QueueApi for AwsQueueApi {
    async fn list_queues(&self, region: &str, token: Option<String>) -> Result<Page<String>> {
        let output = self
            .clients
            .get(region)
            .list_queues()
            .set_next_token(token)
            .max_results(1000)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListQueues {}: {}", region, e)))?;
        Ok(Page {
            items: output.queue_urls().to_vec(),
            next: output.next_token().map(str::to_string),
        })
    }

    async fn attributes(&self, region: &str, url: &str) -> Result<Option<HashMap<String, String>>> {
        let result = self
            .clients
            .get(region)
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(
                output
                    .attributes()
                    .map(|attrs| attrs.iter().map(|(k, v)| (k.as_str().to_string(), v.clone())).collect())
                    .unwrap_or_default(),
            )),
            Err(e) if matches!(e.code(), Some("AWS.SimpleQueueService.NonExistentQueue") | Some("QueueDoesNotExist")) => {
                Ok(None)
            }
            Err(e) => Err(Error::Provider(format!("GetQueueAttributes {}: {}", url, e))),
        }
    }

    async fn tags(&self, region: &str, url: &str) -> Result<HashMap<String, String>> {
        let output = self
            .clients
            .get(region)
            .list_queue_tags()
            .queue_url(url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListQueueTags {}: {}", url, e)))?;
        Ok(output.tags().cloned().unwrap_or_default())
    }
}
