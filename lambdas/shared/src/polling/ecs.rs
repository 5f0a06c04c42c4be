//! ECS cluster poller
//!
//! Cluster snapshots embed their service and task ARNs, so each cluster
//! fans out into two more paginated listings.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecs::types::ClusterField;
use aws_sdk_ecs::Client;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    drain_pages, enrichment, region_token, resume_point, Page, PollContext, PollPage, Poller, RegionalClients,
    SnapshotBatch,
};
use crate::arn::{ecs_cluster_arn, parse};
use crate::errors::{Error, Result};
use crate::models::{ResourceHeader, ResourceType, Snapshot};

const DEFAULT_MAX_CLUSTERS: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub arn: String,
    pub name: String,
    pub status: String,
    pub active_services: i32,
    pub running_tasks: i32,
    pub pending_tasks: i32,
    pub container_instances: i32,
    pub container_insights: Option<String>,
    pub capacity_providers: Vec<String>,
    pub tags: HashMap<String, String>,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_clusters(&self, region: &str, token: Option<String>) -> Result<Page<String>>;

    /// `Ok(None)` when the cluster is missing or inactive
    async fn describe_cluster(&self, region: &str, cluster: &str) -> Result<Option<ClusterInfo>>;

    async fn list_services(&self, region: &str, cluster: &str, token: Option<String>) -> Result<Page<String>>;
    async fn list_tasks(&self, region: &str, cluster: &str, token: Option<String>) -> Result<Page<String>>;
}

pub struct ClusterPoller {
    api: Arc<dyn ClusterApi>,
    max_clusters: usize,
}

impl ClusterPoller {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            max_clusters: DEFAULT_MAX_CLUSTERS,
        }
    }

    pub fn with_max_clusters(mut self, max_clusters: usize) -> Self {
        self.max_clusters = max_clusters.max(1);
        self
    }

    async fn snapshot(&self, ctx: &PollContext, region: &str, cluster: &str) -> Option<Snapshot> {
        let info = match self.api.describe_cluster(region, cluster).await {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!(cluster = %cluster, region = %region, error = %e, "DescribeClusters failed");
                return None;
            }
        };

        let arn = if info.arn.is_empty() {
            ecs_cluster_arn(region, &ctx.account_id, &info.name)
        } else {
            info.arn.clone()
        };
        let mut header = ResourceHeader::new(&arn, ResourceType::EcsCluster, &ctx.account_id, region).with_name(&info.name);
        header.tags = info.tags.clone();

        let mut attributes = json!({
            "status": info.status,
            "activeServicesCount": info.active_services,
            "runningTasksCount": info.running_tasks,
            "pendingTasksCount": info.pending_tasks,
            "registeredContainerInstancesCount": info.container_instances,
            "containerInsights": info.container_insights,
            "capacityProviders": info.capacity_providers,
        });

        let services = drain_pages(|token| self.api.list_services(region, &arn, token)).await;
        if let Some(services) = enrichment(services, &arn, "services") {
            attributes["services"] = json!(services);
        }
        let tasks = drain_pages(|token| self.api.list_tasks(region, &arn, token)).await;
        if let Some(tasks) = enrichment(tasks, &arn, "tasks") {
            attributes["tasks"] = json!(tasks);
        }

        Some(Snapshot::new(header, attributes))
    }
}

#[async_trait]
impl Poller for ClusterPoller {
    fn resource_type(&self) -> ResourceType {
        ResourceType::EcsCluster
    }

    async fn poll_one(&self, ctx: &PollContext, region: &str, resource_id: &str) -> Result<Option<Snapshot>> {
        let region = parse(resource_id).map(|a| a.region).filter(|r| !r.is_empty()).unwrap_or(region);
        Ok(self.snapshot(ctx, region, resource_id).await)
    }

    async fn poll_all(&self, ctx: &PollContext, regions: &[String], page_token: Option<&str>) -> Result<PollPage> {
        let (first, mut start) = resume_point(regions, page_token)?;
        let mut batch = SnapshotBatch::new();
        let mut described = 0;

        for (index, region) in regions.iter().enumerate().skip(first) {
            let mut cursor = start.take();
            loop {
                let page = self.api.list_clusters(region, cursor.clone()).await?;
                for cluster in &page.items {
                    if let Some(snapshot) = self.snapshot(ctx, region, cluster).await {
                        batch.push(snapshot);
                    }
                }
                described += page.items.len();

                let Some(next) = page.next else { break };
                if described >= self.max_clusters {
                    info!(region = %region, clusters = described, "Cluster cutoff reached, continuing later");
                    return Ok(PollPage {
                        snapshots: batch.into_vec(),
                        next_page_token: Some(region_token(region, Some(&next))),
                    });
                }
                cursor = Some(next);
            }

            if described >= self.max_clusters {
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

pub struct AwsClusterApi {
    clients: RegionalClients<Client>,
}

impl AwsClusterApi {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self {
            clients: RegionalClients::new(sdk, |sdk, region| {
                let conf = aws_sdk_ecs::config::Builder::from(sdk)
                    .region(aws_sdk_ecs::config::Region::new(region.to_string()))
                    .build();
                Client::from_conf(conf)
            }),
        }
    }
}

#[async_trait]
impl ClusterApi for AwsClusterApi {
    async fn list_clusters(&self, region: &str, token: Option<String>) -> Result<Page<String>> {
        let output = self
            .clients
            .get(region)
            .list_clusters()
            .set_next_token(token)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListClusters {}: {}", region, e)))?;
        Ok(Page {
            items: output.cluster_arns().to_vec(),
            next: output.next_token().map(str::to_string),
        })
    }

    async fn describe_cluster(&self, region: &str, cluster: &str) -> Result<Option<ClusterInfo>> {
        let output = self
            .clients
            .get(region)
            .describe_clusters()
            .clusters(cluster)
            .include(ClusterField::Tags)
            .include(ClusterField::Settings)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("DescribeClusters {}: {}", cluster, e)))?;

        let Some(c) = output.clusters().first() else {
            return Ok(None);
        };
        if c.status() == Some("INACTIVE") {
            return Ok(None);
        }
        Ok(Some(ClusterInfo {
            arn: c.cluster_arn().unwrap_or_default().to_string(),
            name: c.cluster_name().unwrap_or_default().to_string(),
            status: c.status().unwrap_or_default().to_string(),
            active_services: c.active_services_count(),
            running_tasks: c.running_tasks_count(),
            pending_tasks: c.pending_tasks_count(),
            container_instances: c.registered_container_instances_count(),
            container_insights: c
                .settings()
                .iter()
                .find(|s| s.name().map(|n| n.as_str()) == Some("containerInsights"))
                .and_then(|s| s.value())
                .map(str::to_string),
            capacity_providers: c.capacity_providers().to_vec(),
            tags: c
                .tags()
                .iter()
                .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
                .collect(),
        }))
    }

    async fn list_services(&self, region: &str, cluster: &str, token: Option<String>) -> Result<Page<String>> {
        let output = self
            .clients
            .get(region)
            .list_services()
            .cluster(cluster)
            .set_next_token(token)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListServices {}: {}", cluster, e)))?;
        Ok(Page {
            items: output.service_arns().to_vec(),
            next: output.next_token().map(str::to_string),
        })
    }

    async fn list_tasks(&self, region: &str, cluster: &str, token: Option<String>) -> Result<Page<String>> {
        let output = self
            .clients
            .get(region)
            .list_tasks()
            .cluster(cluster)
            .set_next_token(token)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ListTasks {}: {}", cluster, e)))?;
        Ok(Page {
            items: output.task_arns().to_vec(),
            next: output.next_token().map(str::to_string),
        })
    }
}
