//! CloudTrail trail classifier
//!
//! Every trail mutation rescans all trails in the account: the account-level
//! meta record summarizes them all, so a single-trail scan would leave it stale.

use serde_json::Value;

use super::{missing_target, str_at, unknown_event, EventMetadata};
use crate::arn::cloudtrail_arn;
use crate::models::{ResourceChange, ResourceType};

const TRAIL_MUTATIONS: &[&str] = &[
    "CreateTrail",
    "UpdateTrail",
    "StartLogging",
    "StopLogging",
    "PutEventSelectors",
    "PutInsightSelectors",
    "AddTags",
    "RemoveTags",
];

/// Lake/channel APIs do not touch trails
const IGNORED: &[&str] = &[
    "CreateEventDataStore",
    "UpdateEventDataStore",
    "DeleteEventDataStore",
    "RestoreEventDataStore",
    "StartQuery",
    "CancelQuery",
    "CreateChannel",
    "UpdateChannel",
    "DeleteChannel",
    "StartImport",
    "StopImport",
];

pub fn classify(record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
    let event = meta.event_name.as_str();

    if IGNORED.contains(&event) {
        return vec![];
    }

    if TRAIL_MUTATIONS.contains(&event) {
        return vec![meta.account_scan(ResourceType::CloudTrail)];
    }

    if event != "DeleteTrail" {
        return unknown_event(meta);
    }

    let Some(name) = str_at(record, "/requestParameters/name") else {
        return missing_target(meta, "requestParameters.name");
    };
    let id = if name.starts_with("arn:") {
        name.to_string()
    } else {
        cloudtrail_arn(&meta.region, &meta.account_id, name)
    };

    // The trail is gone, and the meta record must be rebuilt without it
    vec![
        meta.delete(ResourceType::CloudTrail, id),
        meta.account_scan(ResourceType::CloudTrail),
    ]
}
