//! SQS queue classifier

use serde_json::Value;

use super::{missing_target, str_at, unknown_event, EventMetadata};
use crate::arn::{sqs_queue_arn, sqs_queue_arn_from_url};
use crate::models::{ResourceChange, ResourceType};

const QUEUE_MUTATIONS: &[&str] = &[
    "SetQueueAttributes",
    "AddPermission",
    "RemovePermission",
    "TagQueue",
    "UntagQueue",
];

/// Message-plane calls
const IGNORED: &[&str] = &[
    "PurgeQueue",
    "SendMessage",
    "SendMessageBatch",
    "ReceiveMessage",
    "DeleteMessage",
    "DeleteMessageBatch",
    "ChangeMessageVisibility",
    "ChangeMessageVisibilityBatch",
    "StartMessageMoveTask",
    "CancelMessageMoveTask",
];

pub fn classify(record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
    let event = meta.event_name.as_str();

    if IGNORED.contains(&event) {
        return vec![];
    }

    match event {
        "CreateQueue" => {
            let id = str_at(record, "/responseElements/queueUrl")
                .and_then(sqs_queue_arn_from_url)
                .or_else(|| {
                    str_at(record, "/requestParameters/queueName")
                        .map(|name| sqs_queue_arn(&meta.region, &meta.account_id, name))
                });
            match id {
                Some(id) => vec![meta.change(ResourceType::SqsQueue, id)],
                None => missing_target(meta, "requestParameters.queueName"),
            }
        }
        "DeleteQueue" => match queue_id(record) {
            Some(id) => vec![meta.delete(ResourceType::SqsQueue, id)],
            None => missing_target(meta, "requestParameters.queueUrl"),
        },
        _ if QUEUE_MUTATIONS.contains(&event) => match queue_id(record) {
            Some(id) => vec![meta.change(ResourceType::SqsQueue, id)],
            None => missing_target(meta, "requestParameters.queueUrl"),
        },
        _ => unknown_event(meta),
    }
}

fn queue_id(record: &Value) -> Option<String> {
    str_at(record, "/requestParameters/queueUrl").and_then(sqs_queue_arn_from_url)
}
