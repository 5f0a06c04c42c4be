//! S3 bucket poller
//!
//! ListBuckets is global, so every bucket is resolved to its home region
//! with GetBucketLocation and dropped unless that region is being scanned.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{drain_pages, enrichment, Page, PollContext, PollPage, Poller, RegionalClients, SnapshotBatch};
use crate::arn::s3_bucket_arn;
use crate::errors::{Error, Result};
use crate::models::{ResourceHeader, ResourceType, Snapshot};

/// Region used for global S3 calls
const S3_CONTROL_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAccessBlock {
    pub block_public_acls: bool,
    pub ignore_public_acls: bool,
    pub block_public_policy: bool,
    pub restrict_public_buckets: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionRule {
    pub sse_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_master_key_id: Option<String>,
    pub bucket_key_enabled: bool,
}

#[async_trait]
pub trait BucketApi: Send + Sync {
    async fn list_buckets(&self, token: Option<String>) -> Result<Page<String>>;

    /// `Ok(None)` when the bucket no longer exists
    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>>;

    async fn public_access_block(&self, region: &str, bucket: &str) -> Result<Option<PublicAccessBlock>>;
    async fn encryption(&self, region: &str, bucket: &str) -> Result<Vec<EncryptionRule>>;
    async fn versioning(&self, region: &str, bucket: &str) -> Result<Option<String>>;
    async fn tags(&self, region: &str, bucket: &str) -> Result<HashMap<String, String>>;
}

pub struct BucketPoller {
    api: Arc<dyn BucketApi>,
}

impl BucketPoller {
    pub fn new(api: Arc<dyn BucketApi>) -> Self {
        Self { api }
    }

    async fn snapshot(&self, ctx: &PollContext, region: &str, bucket: &str) -> Result<Snapshot> {
        let id = s3_bucket_arn(bucket);
        let mut header = ResourceHeader::new(&id, ResourceType::S3Bucket, &ctx.account_id, region).with_name(bucket);
        let mut attributes = Map::new();
        attributes.insert("bucketName".into(), json!(bucket));

        if let Some(block) = enrichment(self.api.public_access_block(region, bucket).await, &id, "publicAccessBlock") {
            attributes.insert("publicAccessBlock".into(), serde_json::to_value(block)?);
        }
        if let Some(rules) = enrichment(self.api.encryption(region, bucket).await, &id, "encryption") {
            attributes.insert("encrypted".into(), json!(!rules.is_empty()));
            attributes.insert("encryptionRules".into(), serde_json::to_value(rules)?);
        }
        if let Some(status) = enrichment(self.api.versioning(region, bucket).await, &id, "versioning") {
            attributes.insert("versioning".into(), json!(status));
        }
        if let Some(tags) = enrichment(self.api.tags(region, bucket).await, &id, "tags") {
            header.tags = tags;
        }

        Ok(Snapshot::new(header, Value::Object(attributes)))
    }
}

#[async_trait]
impl Poller for BucketPoller {
    fn resource_type(&self) -> ResourceType {
        ResourceType::S3Bucket
    }

    async fn poll_one(&self, ctx: &PollContext, _region: &str, resource_id: &str) -> Result<Option<Snapshot>> {
        let bucket = resource_id.strip_prefix("arn:aws:s3:::").unwrap_or(resource_id);
        match self.api.bucket_region(bucket).await {
            Ok(Some(region)) => Ok(Some(self.snapshot(ctx, &region, bucket).await?)),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(resource_id = %resource_id, error = %e, "Failed to locate bucket");
                Ok(None)
            }
        }
    }

    async fn poll_all(&self, ctx: &PollContext, regions: &[String], _page_token: Option<&str>) -> Result<PollPage> {
        let buckets = drain_pages(|token| self.api.list_buckets(token)).await?;
        let mut batch = SnapshotBatch::new();

        for bucket in buckets {
            let region = match self.api.bucket_region(&bucket).await {
                Ok(Some(region)) => region,
                Ok(None) => continue,
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "Failed to locate bucket, skipping");
                    continue;
                }
            };
            if !regions.iter().any(|r| r == &region) {
                debug!(bucket = %bucket, region = %region, "Bucket outside scanned regions");
                continue;
            }
            batch.push(self.snapshot(ctx, &region, &bucket).await?);
        }

        Ok(PollPage {
            snapshots: batch.into_vec(),
            next_page_token: None,
        })
    }
}

/// Empty location means us-east-1; `EU` is the legacy name of eu-west-1
fn normalize_location(constraint: Option<&str>) -> String {
    match constraint {
        None | Some("") => "us-east-1".to_string(),
        Some("EU") => "eu-west-1".to_string(),
        Some(region) => region.to_string(),
    }
}

pub struct AwsBucketApi {
    clients: RegionalClients<Client>,
}

impl AwsBucketApi {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self {
            clients: RegionalClients::new(sdk, |sdk, region| {
                let conf = aws_sdk_s3::config::Builder::from(sdk)
                    .region(aws_sdk_s3::config::Region::new(region.to_string()))
                    .build();
                Client::from_conf(conf)
            }),
        }
    }
}

#[async_trait]
impl BucketApi for AwsBucketApi {
    async fn list_buckets(&self, token: Option<String>) -> Result<Page<String>> {
        let output = self
            .clients
            .get(S3_CONTROL_REGION)
            .list_buckets()
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListBuckets: {}", e)))?;

        Ok(Page {
            items: output.buckets().iter().filter_map(|b| b.name().map(str::to_string)).collect(),
            next: output.continuation_token().map(str::to_string),
        })
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>> {
        match self.clients.get(S3_CONTROL_REGION).get_bucket_location().bucket(bucket).send().await {
            Ok(output) => Ok(Some(normalize_location(output.location_constraint().map(|c| c.as_str())))),
            Err(e) if e.code() == Some("NoSuchBucket") => Ok(None),
            Err(e) => Err(Error::Provider(format!("GetBucketLocation {}: {}", bucket, e))),
        }
    }

    async fn public_access_block(&self, region: &str, bucket: &str) -> Result<Option<PublicAccessBlock>> {
        match self.clients.get(region).get_public_access_block().bucket(bucket).send().await {
            Ok(output) => Ok(output.public_access_block_configuration().map(|c| PublicAccessBlock {
                block_public_acls: c.block_public_acls().unwrap_or(false),
                ignore_public_acls: c.ignore_public_acls().unwrap_or(false),
                block_public_policy: c.block_public_policy().unwrap_or(false),
                restrict_public_buckets: c.restrict_public_buckets().unwrap_or(false),
            })),
            Err(e) if e.code() == Some("NoSuchPublicAccessBlockConfiguration") => Ok(None),
            Err(e) => Err(Error::Provider(format!("GetPublicAccessBlock {}: {}", bucket, e))),
        }
    }

    async fn encryption(&self, region: &str, bucket: &str) -> Result<Vec<EncryptionRule>> {
        match self.clients.get(region).get_bucket_encryption().bucket(bucket).send().await {
            Ok(output) => Ok(output
                .server_side_encryption_configuration()
                .map(|c| c.rules())
                .unwrap_or_default()
                .iter()
                .filter_map(|rule| {
                    let default = rule.apply_server_side_encryption_by_default()?;
                    Some(EncryptionRule {
                        sse_algorithm: default.sse_algorithm().as_str().to_string(),
                        kms_master_key_id: default.kms_master_key_id().map(str::to_string),
                        bucket_key_enabled: rule.bucket_key_enabled().unwrap_or(false),
                    })
                })
                .collect()),
            Err(e) if e.code() == Some("ServerSideEncryptionConfigurationNotFoundError") => Ok(vec![]),
            Err(e) => Err(Error::Provider(format!("GetBucketEncryption {}: {}", bucket, e))),
        }
    }

    async fn versioning(&self, region: &str, bucket: &str) -> Result<Option<String>> {
        let output = self
            .clients
            .get(region)
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("GetBucketVersioning {}: {}", bucket, e)))?;
        Ok(output.status().map(|s| s.as_str().to_string()))
    }

    async fn tags(&self, region: &str, bucket: &str) -> Result<HashMap<String, String>> {
        match self.clients.get(region).get_bucket_tagging().bucket(bucket).send().await {
            Ok(output) => Ok(output
                .tag_set()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect()),
            Err(e) if e.code() == Some("NoSuchTagSet") => Ok(HashMap::new()),
            Err(e) => Err(Error::Provider(format!("GetBucketTagging {}: {}", bucket, e))),
        }
    }
}
