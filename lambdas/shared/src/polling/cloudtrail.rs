//! CloudTrail trail poller
//!
//! DescribeTrails in any region also returns shadow copies of multi-region
//! and organization trails. Only the copy in the trail's home region is
//! kept. Every whole-type poll also yields one account-level meta snapshot
//! summarizing all trails, including when there are none.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudtrail::Client;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{drain_pages, enrichment, Page, PollContext, PollPage, Poller, RegionalClients, SnapshotBatch};
use crate::arn::parse;
use crate::errors::{Error, Result};
use crate::models::{ResourceHeader, ResourceType, Snapshot};

/// Region recorded on the account-level meta snapshot
pub const META_REGION: &str = "global";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailInfo {
    pub arn: String,
    pub name: String,
    pub home_region: String,
    pub is_multi_region: bool,
    pub log_file_validation: bool,
    pub is_organization_trail: bool,
    pub include_global_service_events: bool,
    pub s3_bucket_name: Option<String>,
    pub kms_key_id: Option<String>,
    pub log_group_arn: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailStatus {
    pub is_logging: bool,
    pub latest_delivery_error: Option<String>,
}

#[async_trait]
pub trait TrailApi: Send + Sync {
    /// Trails visible from `region`, shadow copies included
    async fn describe_trails(&self, region: &str) -> Result<Vec<TrailInfo>>;

    async fn trail_status(&self, region: &str, arn: &str) -> Result<TrailStatus>;
    async fn event_selectors(&self, region: &str, arn: &str) -> Result<Value>;
    async fn tags(&self, region: &str, arn: &str) -> Result<HashMap<String, String>>;
}

/// Meta snapshot id for an account
pub fn meta_id(account_id: &str) -> String {
    format!("{}::{}", account_id, ResourceType::CloudTrailMeta)
}

pub struct TrailPoller {
    api: Arc<dyn TrailApi>,
}

impl TrailPoller {
    pub fn new(api: Arc<dyn TrailApi>) -> Self {
        Self { api }
    }

    /// Snapshot of one home-region trail, plus whether it is logging
    async fn snapshot(&self, ctx: &PollContext, trail: &TrailInfo) -> Result<(Snapshot, bool)> {
        let region = trail.home_region.as_str();
        let mut header = ResourceHeader::new(&trail.arn, ResourceType::CloudTrail, &ctx.account_id, region)
            .with_name(&trail.name);

        let mut attributes = json!({
            "name": trail.name,
            "homeRegion": trail.home_region,
            "isMultiRegionTrail": trail.is_multi_region,
            "logFileValidationEnabled": trail.log_file_validation,
            "isOrganizationTrail": trail.is_organization_trail,
            "includeGlobalServiceEvents": trail.include_global_service_events,
            "s3BucketName": trail.s3_bucket_name,
            "kmsKeyId": trail.kms_key_id,
            "cloudWatchLogsLogGroupArn": trail.log_group_arn,
        });

        let mut logging = false;
        if let Some(status) = enrichment(self.api.trail_status(region, &trail.arn).await, &trail.arn, "status") {
            logging = status.is_logging;
            attributes["isLogging"] = json!(status.is_logging);
            attributes["latestDeliveryError"] = json!(status.latest_delivery_error);
        }
        if let Some(selectors) = enrichment(self.api.event_selectors(region, &trail.arn).await, &trail.arn, "eventSelectors") {
            attributes["eventSelectors"] = selectors;
        }
        if let Some(tags) = enrichment(self.api.tags(region, &trail.arn).await, &trail.arn, "tags") {
            header.tags = tags;
        }

        Ok((Snapshot::new(header, attributes), logging))
    }
}

/// Account-wide trail facts folded into the meta snapshot
#[derive(Debug, Default)]
struct TrailSummary {
    trails: BTreeMap<String, (TrailInfo, bool)>,
}

impl TrailSummary {
    fn observe(&mut self, trail: TrailInfo, logging: bool) {
        self.trails.insert(trail.arn.clone(), (trail, logging));
    }

    fn snapshot(&self, ctx: &PollContext) -> Snapshot {
        let trails = self.trails.values();
        let header = ResourceHeader::new(meta_id(&ctx.account_id), ResourceType::CloudTrailMeta, &ctx.account_id, META_REGION)
            .with_name(ResourceType::CloudTrailMeta.as_str());

        let attributes = json!({
            "trailCount": self.trails.len(),
            "trails": self.trails.keys().collect::<Vec<_>>(),
            "multiRegionLoggingEnabled": trails.clone().any(|(t, logging)| t.is_multi_region && *logging),
            "logFileValidationOnAll": !self.trails.is_empty() && trails.clone().all(|(t, _)| t.log_file_validation),
            "organizationTrailPresent": trails.clone().any(|(t, _)| t.is_organization_trail),
            "globalServiceEventsCaptured": trails.clone().any(|(t, logging)| t.include_global_service_events && *logging),
        });
        Snapshot::new(header, attributes)
    }
}

#[async_trait]
impl Poller for TrailPoller {
    fn resource_type(&self) -> ResourceType {
        ResourceType::CloudTrail
    }

    /// `poll_all` also rebuilds the account summary
    fn account_wide(&self) -> bool {
        true
    }

    async fn poll_one(&self, ctx: &PollContext, region: &str, resource_id: &str) -> Result<Option<Snapshot>> {
        let region = parse(resource_id)
            .map(|arn| arn.region)
            .filter(|r| !r.is_empty())
            .unwrap_or(region);

        let trails = self.api.describe_trails(region).await?;
        let Some(trail) = trails.iter().find(|t| t.arn == resource_id || t.name == resource_id) else {
            return Ok(None);
        };
        Ok(Some(self.snapshot(ctx, trail).await?.0))
    }

    async fn poll_all(&self, ctx: &PollContext, regions: &[String], _page_token: Option<&str>) -> Result<PollPage> {
        let mut batch = SnapshotBatch::new();
        let mut summary = TrailSummary::default();

        for region in regions {
            let trails = self.api.describe_trails(region).await?;
            for trail in trails.into_iter().filter(|t| &t.home_region == region) {
                let (snapshot, logging) = self.snapshot(ctx, &trail).await?;
                batch.push(snapshot);
                summary.observe(trail, logging);
            }
        }

        batch.push(summary.snapshot(ctx));
        Ok(PollPage {
            snapshots: batch.into_vec(),
            next_page_token: None,
        })
    }
}

pub struct AwsTrailApi {
    clients: RegionalClients<Client>,
}

impl AwsTrailApi {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self {
            clients: RegionalClients::new(sdk, |sdk, region| {
                let conf = aws_sdk_cloudtrail::config::Builder::from(sdk)
                    .region(aws_sdk_cloudtrail::config::Region::new(region.to_string()))
                    .build();
                Client::from_conf(conf)
            }),
        }
    }
}

#[async_trait]
impl TrailApi for AwsTrailApi {
    async fn describe_trails(&self, region: &str) -> Result<Vec<TrailInfo>> {
        let output = self
            .clients
            .get(region)
            .describe_trails()
            .include_shadow_trails(true)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("DescribeTrails {}: {}", region, e)))?;

        Ok(output
            .trail_list()
            .iter()
            .filter_map(|t| {
                Some(TrailInfo {
                    arn: t.trail_arn()?.to_string(),
                    name: t.name().unwrap_or_default().to_string(),
                    home_region: t.home_region().unwrap_or(region).to_string(),
                    is_multi_region: t.is_multi_region_trail().unwrap_or(false),
                    log_file_validation: t.log_file_validation_enabled().unwrap_or(false),
                    is_organization_trail: t.is_organization_trail().unwrap_or(false),
                    include_global_service_events: t.include_global_service_events().unwrap_or(false),
                    s3_bucket_name: t.s3_bucket_name().map(str::to_string),
                    kms_key_id: t.kms_key_id().map(str::to_string),
                    log_group_arn: t.cloud_watch_logs_log_group_arn().map(str::to_string),
                })
            })
            .collect())
    }

    async fn trail_status(&self, region: &str, arn: &str) -> Result<TrailStatus> {
        let output = self
            .clients
            .get(region)
            .get_trail_status()
            .name(arn)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("GetTrailStatus {}: {}", arn, e)))?;
        Ok(TrailStatus {
            is_logging: output.is_logging().unwrap_or(false),
            latest_delivery_error: output.latest_delivery_error().map(str::to_string),
        })
    }

    async fn event_selectors(&self, region: &str, arn: &str) -> Result<Value> {
        let output = self
            .clients
            .get(region)
            .get_event_selectors()
            .trail_name(arn)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("GetEventSelectors {}: {}", arn, e)))?;

        let basic: Vec<Value> = output
            .event_selectors()
            .iter()
            .map(|s| {
                json!({
                    "readWriteType": s.read_write_type().map(|r| r.as_str()),
                    "includeManagementEvents": s.include_management_events(),
                    "dataResourceTypes": s.data_resources().iter().filter_map(|d| d.r#type()).collect::<Vec<_>>(),
                })
            })
            .collect();
        let advanced: Vec<Option<&str>> = output.advanced_event_selectors().iter().map(|s| s.name()).collect();

        Ok(json!({ "basic": basic, "advanced": advanced }))
    }

    async fn tags(&self, region: &str, arn: &str) -> Result<HashMap<String, String>> {
        let client = self.clients.get(region);
        let tags = drain_pages(|token| {
            let request = client.list_tags().resource_id_list(arn).set_next_token(token);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(|e| Error::Provider(format!("ListTags {}: {}", arn, e)))?;
                Ok(Page {
                    items: output
                        .resource_tag_list()
                        .iter()
                        .flat_map(|r| r.tags_list())
                        .map(|t| (t.key().to_string(), t.value().unwrap_or_default().to_string()))
                        .collect(),
                    next: output.next_token().map(str::to_string),
                })
            }
        })
        .await?;
        Ok(tags.into_iter().collect())
    }
}
