//! DynamoDB table classifier

use serde_json::Value;

use super::{missing_target, str_at, unknown_event, EventMetadata};
use crate::arn::{canonical_resource, dynamodb_table_arn};
use crate::models::{ResourceChange, ResourceType};

/// Tables sit in CREATING/UPDATING for a while before describe reflects the change
const SETTLE_DELAY_SECONDS: u32 = 30;
/// Restores take much longer to surface a usable table
const RESTORE_DELAY_SECONDS: u32 = 120;

const TABLE_MUTATIONS: &[&str] = &[
    "UpdateTimeToLive",
    "UpdateContinuousBackups",
    "UpdateContributorInsights",
    "EnableKinesisStreamingDestination",
    "DisableKinesisStreamingDestination",
    "PutResourcePolicy",
    "DeleteResourcePolicy",
];

const IGNORED: &[&str] = &[
    "CreateBackup",
    "DeleteBackup",
    "ExportTableToPointInTime",
    "ImportTable",
    "PutItem",
    "UpdateItem",
    "DeleteItem",
    "BatchWriteItem",
    "TransactWriteItems",
];

pub fn classify(record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
    let event = meta.event_name.as_str();

    if IGNORED.contains(&event) {
        return vec![];
    }

    match event {
        "CreateGlobalTable" | "UpdateGlobalTable" | "UpdateGlobalTableSettings" => {
            // Replicas land in other regions too
            vec![meta.account_scan(ResourceType::DynamoDbTable).with_delay(SETTLE_DELAY_SECONDS)]
        }
        "TagResource" | "UntagResource" => {
            let Some(arn) = str_at(record, "/requestParameters/resourceArn") else {
                return missing_target(meta, "requestParameters.resourceArn");
            };
            match canonical_resource(arn) {
                Some((ResourceType::DynamoDbTable, id)) => vec![meta.change(ResourceType::DynamoDbTable, id)],
                _ => vec![meta.region_scan(ResourceType::DynamoDbTable)],
            }
        }
        "RestoreTableFromBackup" | "RestoreTableToPointInTime" => {
            let Some(table) = str_at(record, "/requestParameters/targetTableName") else {
                return missing_target(meta, "requestParameters.targetTableName");
            };
            vec![meta
                .change(ResourceType::DynamoDbTable, table_id(record, meta, table))
                .with_delay(RESTORE_DELAY_SECONDS)]
        }
        "CreateTable" | "UpdateTable" | "DeleteTable" => {
            let Some(table) = str_at(record, "/requestParameters/tableName") else {
                return missing_target(meta, "requestParameters.tableName");
            };
            let id = table_id(record, meta, table);
            if event == "DeleteTable" {
                vec![meta.delete(ResourceType::DynamoDbTable, id)]
            } else {
                vec![meta.change(ResourceType::DynamoDbTable, id).with_delay(SETTLE_DELAY_SECONDS)]
            }
        }
        _ if TABLE_MUTATIONS.contains(&event) => {
            let Some(table) = str_at(record, "/requestParameters/tableName") else {
                return missing_target(meta, "requestParameters.tableName");
            };
            vec![meta.change(ResourceType::DynamoDbTable, table_id(record, meta, table))]
        }
        _ => unknown_event(meta),
    }
}

/// Prefer the ARN the service echoed back; otherwise build it from the event
fn table_id(record: &Value, meta: &EventMetadata, table: &str) -> String {
    str_at(record, "/responseElements/tableDescription/tableArn")
        .map(str::to_string)
        .unwrap_or_else(|| dynamodb_table_arn(&meta.region, &meta.account_id, table))
}
