//! ECS cluster classifier
//!
//! Services and tasks are sub-resources of the cluster snapshot, so their
//! lifecycle events rescan the owning cluster.

use serde_json::Value;

use super::{missing_target, str_at, unknown_event, EventMetadata};
use crate::arn::{canonical_resource, ecs_cluster_arn};
use crate::models::{ResourceChange, ResourceType};

/// Stopped tasks linger in listings until they drain
const TASK_STOP_DELAY_SECONDS: u32 = 60;

const CLUSTER_MUTATIONS: &[&str] = &[
    "UpdateCluster",
    "UpdateClusterSettings",
    "PutClusterCapacityProviders",
    "CreateService",
    "UpdateService",
    "DeleteService",
    "RunTask",
    "StartTask",
    "UpdateContainerInstancesState",
];

/// Agent chatter and account-level settings
const IGNORED: &[&str] = &[
    "DiscoverPollEndpoint",
    "Poll",
    "StartTelemetrySession",
    "SubmitTaskStateChange",
    "SubmitContainerStateChange",
    "SubmitAttachmentStateChanges",
    "RegisterTaskDefinition",
    "DeregisterTaskDefinition",
    "DeleteTaskDefinitions",
    "PutAccountSetting",
    "PutAccountSettingDefault",
    "DeleteAccountSetting",
];

pub fn classify(record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
    let event = meta.event_name.as_str();

    if IGNORED.contains(&event) {
        return vec![];
    }

    match event {
        "CreateCluster" => {
            let id = str_at(record, "/responseElements/cluster/clusterArn")
                .map(str::to_string)
                .or_else(|| {
                    str_at(record, "/requestParameters/clusterName")
                        .map(|name| ecs_cluster_arn(&meta.region, &meta.account_id, name))
                })
                .unwrap_or_else(|| ecs_cluster_arn(&meta.region, &meta.account_id, "default"));
            vec![meta.change(ResourceType::EcsCluster, id)]
        }
        "DeleteCluster" => {
            let Some(cluster) = str_at(record, "/requestParameters/cluster") else {
                return missing_target(meta, "requestParameters.cluster");
            };
            vec![meta.delete(ResourceType::EcsCluster, cluster_id(meta, cluster))]
        }
        "TagResource" | "UntagResource" => {
            let Some(arn) = str_at(record, "/requestParameters/resourceArn") else {
                return missing_target(meta, "requestParameters.resourceArn");
            };
            match canonical_resource(arn) {
                Some((ResourceType::EcsCluster, id)) => vec![meta.change(ResourceType::EcsCluster, id)],
                // Old-format service/task ARNs do not name their cluster
                _ => vec![meta.region_scan(ResourceType::EcsCluster)],
            }
        }
        "StopTask" => vec![meta
            .change(ResourceType::EcsCluster, request_cluster_id(record, meta))
            .with_delay(TASK_STOP_DELAY_SECONDS)],
        _ if CLUSTER_MUTATIONS.contains(&event) => {
            vec![meta.change(ResourceType::EcsCluster, request_cluster_id(record, meta))]
        }
        _ => unknown_event(meta),
    }
}

/// ECS calls that omit `cluster` act on the account's default cluster
fn request_cluster_id(record: &Value, meta: &EventMetadata) -> String {
    let cluster = str_at(record, "/requestParameters/cluster").unwrap_or("default");
    cluster_id(meta, cluster)
}

fn cluster_id(meta: &EventMetadata, cluster: &str) -> String {
    if cluster.starts_with("arn:") {
        cluster.to_string()
    } else {
        ecs_cluster_arn(&meta.region, &meta.account_id, cluster)
    }
}
