//! Resource Groups Tagging API classifier
//!
//! Tag events name resources only by generic ARN. Each ARN is pinned to the
//! most specific tracked resource we can infer; when even the type is
//! unknown the whole region is rescanned. That fallback is deliberately
//! conservative.

use serde_json::Value;
use std::collections::BTreeSet;

use super::{unknown_event, EventMetadata};
use crate::arn::{canonical_resource, parse, service_resource_type};
use crate::models::{ResourceChange, ResourceType};

pub fn classify(record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
    match meta.event_name.as_str() {
        "TagResources" | "UntagResources" => {}
        _ => return unknown_event(meta),
    }

    let arns: Vec<&str> = record
        .pointer("/requestParameters/resourceARNList")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if arns.is_empty() {
        return whole_region(meta);
    }

    let mut changes = Vec::new();
    let mut region_scans = BTreeSet::new();
    let mut needs_whole_region = false;

    for arn in arns {
        if let Some((resource_type, id)) = canonical_resource(arn) {
            changes.push(meta.change(resource_type, id));
            continue;
        }
        match parse(arn).and_then(|a| service_resource_type(a.service)) {
            Some(resource_type) => {
                region_scans.insert(resource_type);
            }
            None => needs_whole_region = true,
        }
    }

    if needs_whole_region {
        changes.extend(whole_region(meta));
    } else {
        changes.extend(region_scans.into_iter().map(|t| meta.region_scan(t)));
    }
    changes
}

fn whole_region(meta: &EventMetadata) -> Vec<ResourceChange> {
    ResourceType::ALL
        .iter()
        .filter(|t| **t != ResourceType::CloudTrailMeta)
        .map(|t| meta.region_scan(*t))
        .collect()
}
