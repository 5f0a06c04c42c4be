//! DynamoDB table poller
//!
//! Accounts can hold thousands of tables, so a whole-type poll stops after
//! `max_tables` and hands back a continuation token for the rest.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    drain_pages, enrichment, region_token, resume_point, Page, PollContext, PollPage, Poller, RegionalClients,
    SnapshotBatch,
};
use crate::arn::{dynamodb_table_arn, parse};
use crate::errors::{Error, Result};
use crate::models::{ResourceHeader, ResourceType, Snapshot};

const DEFAULT_MAX_TABLES: usize = 250;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    pub arn: String,
    pub name: String,
    pub status: String,
    pub item_count: i64,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_type: Option<String>,
    pub stream_enabled: bool,
    pub deletion_protection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[async_trait]
pub trait TableApi: Send + Sync {
    async fn list_tables(&self, region: &str, start: Option<String>) -> Result<Page<String>>;

    /// `Ok(None)` when the table does not exist
    async fn describe_table(&self, region: &str, name: &str) -> Result<Option<TableDescription>>;

    async fn time_to_live(&self, region: &str, name: &str) -> Result<Option<String>>;
    async fn point_in_time_recovery(&self, region: &str, name: &str) -> Result<bool>;
    async fn tags(&self, region: &str, arn: &str) -> Result<HashMap<String, String>>;
}

pub struct TablePoller {
    api: Arc<dyn TableApi>,
    max_tables: usize,
}

impl TablePoller {
    pub fn new(api: Arc<dyn TableApi>) -> Self {
        Self {
            api,
            max_tables: DEFAULT_MAX_TABLES,
        }
    }

    pub fn with_max_tables(mut self, max_tables: usize) -> Self {
        self.max_tables = max_tables.max(1);
        self
    }

    async fn snapshot(&self, ctx: &PollContext, region: &str, name: &str) -> Result<Option<Snapshot>> {
        let table = match self.api.describe_table(region, name).await {
            Ok(Some(table)) => table,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(table = %name, region = %region, error = %e, "DescribeTable failed");
                return Ok(None);
            }
        };

        let arn = if table.arn.is_empty() {
            dynamodb_table_arn(region, &ctx.account_id, name)
        } else {
            table.arn.clone()
        };
        let mut header = ResourceHeader::new(&arn, ResourceType::DynamoDbTable, &ctx.account_id, region).with_name(name);

        let mut attributes = match serde_json::to_value(&table)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(ttl) = enrichment(self.api.time_to_live(region, name).await, &arn, "timeToLive") {
            attributes.insert("timeToLiveStatus".into(), json!(ttl));
        }
        if let Some(pitr) = enrichment(self.api.point_in_time_recovery(region, name).await, &arn, "continuousBackups") {
            attributes.insert("pointInTimeRecovery".into(), json!(pitr));
        }
        if let Some(tags) = enrichment(self.api.tags(region, &arn).await, &arn, "tags") {
            header.tags = tags;
        }

        Ok(Some(Snapshot::new(header, Value::Object(attributes))))
    }
}

#[async_trait]
impl Poller for TablePoller {
    fn resource_type(&self) -> ResourceType {
        ResourceType::DynamoDbTable
    }

    async fn poll_one(&self, ctx: &PollContext, region: &str, resource_id: &str) -> Result<Option<Snapshot>> {
        let (region, name) = match parse(resource_id) {
            Some(arn) => (
                if arn.region.is_empty() { region } else { arn.region },
                arn.resource.strip_prefix("table/").unwrap_or(arn.resource),
            ),
            None => (region, resource_id),
        };
        self.snapshot(ctx, region, name).await
    }

    async fn poll_all(&self, ctx: &PollContext, regions: &[String], page_token: Option<&str>) -> Result<PollPage> {
        let (first, mut start) = resume_point(regions, page_token)?;
        let mut batch = SnapshotBatch::new();
        let mut described = 0;

        for (index, region) in regions.iter().enumerate().skip(first) {
            let mut cursor = start.take();
            loop {
                let page = self.api.list_tables(region, cursor.clone()).await?;
                for name in &page.items {
                    if let Some(snapshot) = self.snapshot(ctx, region, name).await? {
                        batch.push(snapshot);
                    }
                }
                described += page.items.len();

                let Some(next) = page.next else { break };
                if described >= self.max_tables {
                    info!(region = %region, tables = described, "Table cutoff reached, continuing later");
                    return Ok(PollPage {
                        snapshots: batch.into_vec(),
                        next_page_token: Some(region_token(region, Some(&next))),
                    });
                }
                cursor = Some(next);
            }

            if described >= self.max_tables {
                if let Some(next_region) = regions.get(index + 1) {
                    return Ok(PollPage {
                        snapshots: batch.into_vec(),
                        next_page_token: Some(region_token(next_region, None)),
                    });
                }
            }
        }

        Ok(PollPage {
            snapshots: batch.into_vec(),
            next_page_token: None,
        })
    }
}

pub struct AwsTableApi {
    clients: RegionalClients<Client>,
}

impl AwsTableApi {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self {
            clients: RegionalClients::new(sdk, |sdk, region| {
                let conf = aws_sdk_dynamodb::config::Builder::from(sdk)
                    .region(aws_sdk_dynamodb::config::Region::new(region.to_string()))
                    .build();
                Client::from_conf(conf)
            }),
        }
    }
}

#[async_trait]
impl TableApi for AwsTableApi {
    async fn list_tables(&self, region: &str, start: Option<String>) -> Result<Page<String>> {
        let output = self
            .clients
            .get(region)
            .list_tables()
            .set_exclusive_start_table_name(start)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListTables {}: {}", region, e)))?;
        Ok(Page {
            items: output.table_names().to_vec(),
            next: output.last_evaluated_table_name().map(str::to_string),
        })
    }

    async fn describe_table(&self, region: &str, name: &str) -> Result<Option<TableDescription>> {
        let output = match self.clients.get(region).describe_table().table_name(name).send().await {
            Ok(output) => output,
            Err(e) if e.code() == Some("ResourceNotFoundException") => return Ok(None),
            Err(e) => return Err(Error::Provider(format!("DescribeTable {}: {}", name, e))),
        };
        let Some(table) = output.table() else {
            return Ok(None);
        };
        Ok(Some(TableDescription {
            arn: table.table_arn().unwrap_or_default().to_string(),
            name: table.table_name().unwrap_or(name).to_string(),
            status: table.table_status().map(|s| s.as_str().to_string()).unwrap_or_default(),
            item_count: table.item_count().unwrap_or_default(),
            size_bytes: table.table_size_bytes().unwrap_or_default(),
            billing_mode: table
                .billing_mode_summary()
                .and_then(|b| b.billing_mode())
                .map(|m| m.as_str().to_string()),
            sse_type: table
                .sse_description()
                .and_then(|s| s.sse_type())
                .map(|t| t.as_str().to_string()),
            stream_enabled: table
                .stream_specification()
                .map(|s| s.stream_enabled())
                .unwrap_or(false),
            deletion_protection: table.deletion_protection_enabled().unwrap_or(false),
            created_at: table.creation_date_time().map(|t| t.to_string()),
        }))
    }

    async fn time_to_live(&self, region: &str, name: &str) -> Result<Option<String>> {
        let output = self
            .clients
            .get(region)
            .describe_time_to_live()
            .table_name(name)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("DescribeTimeToLive {}: {}", name, e)))?;
        Ok(output
            .time_to_live_description()
            .and_then(|d| d.time_to_live_status())
            .map(|s| s.as_str().to_string()))
    }

    async fn point_in_time_recovery(&self, region: &str, name: &str) -> Result<bool> {
        let output = self
            .clients
            .get(region)
            .describe_continuous_backups()
            .table_name(name)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("DescribeContinuousBackups {}: {}", name, e)))?;
        Ok(output
            .continuous_backups_description()
            .and_then(|d| d.point_in_time_recovery_description())
            .and_then(|p| p.point_in_time_recovery_status())
            .map(|s| s.as_str() == "ENABLED")
            .unwrap_or(false))
    }

    async fn tags(&self, region: &str, arn: &str) -> Result<HashMap<String, String>> {
        let client = self.clients.get(region);
        let tags = drain_pages(|token| {
            let request = client.list_tags_of_resource().resource_arn(arn).set_next_token(token);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(|e| Error::Provider(format!("ListTagsOfResource {}: {}", arn, e)))?;
                Ok(Page {
                    items: output
                        .tags()
                        .iter()
                        .map(|t| (t.key().to_string(), t.value().to_string()))
                        .collect(),
                    next: output.next_token().map(str::to_string),
                })
            }
        })
        .await?;
        Ok(tags.into_iter().collect())
    }
}
