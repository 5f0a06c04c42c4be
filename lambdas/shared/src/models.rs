//! Domain models for Snapshot
//!
//! These types flow through the pipeline:
//! - ResourceChange: "this resource (or class of resources) may have changed"
//! - ScanEntry / ScanMsg: the wire contract of the scan request queue
//! - Snapshot: the normalized output of a poller, keyed by resource id
//! - Integration: an onboarded account as seen by the account directory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Resource types known to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "AWS.S3.Bucket")]
    S3Bucket,
    #[serde(rename = "AWS.DynamoDB.Table")]
    DynamoDbTable,
    #[serde(rename = "AWS.CloudTrail")]
    CloudTrail,
    #[serde(rename = "AWS.CloudTrail.Meta")]
    CloudTrailMeta,
    #[serde(rename = "AWS.SQS.Queue")]
    SqsQueue,
    #[serde(rename = "AWS.ECS.Cluster")]
    EcsCluster,
    #[serde(rename = "AWS.KMS.Key")]
    KmsKey,
    #[serde(rename = "AWS.Lambda.Function")]
    LambdaFunction,
}

impl ResourceType {
    pub const ALL: [ResourceType; 8] = [
        ResourceType::S3Bucket,
        ResourceType::DynamoDbTable,
        ResourceType::CloudTrail,
        ResourceType::CloudTrailMeta,
        ResourceType::SqsQueue,
        ResourceType::EcsCluster,
        ResourceType::KmsKey,
        ResourceType::LambdaFunction,
    ];

    /// Regional types a whole-region rescan falls back to
    pub const REGIONAL: [ResourceType; 5] = [
        ResourceType::DynamoDbTable,
        ResourceType::SqsQueue,
        ResourceType::EcsCluster,
        ResourceType::KmsKey,
        ResourceType::LambdaFunction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::S3Bucket => "AWS.S3.Bucket",
            ResourceType::DynamoDbTable => "AWS.DynamoDB.Table",
            ResourceType::CloudTrail => "AWS.CloudTrail",
            ResourceType::CloudTrailMeta => "AWS.CloudTrail.Meta",
            ResourceType::SqsQueue => "AWS.SQS.Queue",
            ResourceType::EcsCluster => "AWS.ECS.Cluster",
            ResourceType::KmsKey => "AWS.KMS.Key",
            ResourceType::LambdaFunction => "AWS.Lambda.Function",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownResourceType(s.to_string()))
    }
}

/// Identity of a change within one batch.
///
/// The account keeps scan-all changes (empty id) of different accounts apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeKey {
    pub account_id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub region: String,
}

/// Something in an account may have changed and needs a delete or a rescan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChange {
    pub account_id: String,
    pub region: String,
    /// Empty means scan every resource of this type (in `region`, or account-wide if that is empty too)
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub integration_id: String,
    pub delete: bool,
    pub event_name: String,
    /// Normalized RFC3339; compares lexicographically
    pub event_time: String,
    /// Seconds to defer the resulting scan
    pub delay: u32,
}

impl ResourceChange {
    pub fn key(&self) -> ChangeKey {
        ChangeKey {
            account_id: self.account_id.clone(),
            resource_id: self.resource_id.clone(),
            resource_type: self.resource_type,
            region: self.region.clone(),
        }
    }

    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    pub fn is_scan_all(&self) -> bool {
        self.resource_id.is_empty()
    }

    /// Whether `self` should replace `other` for the same key.
    ///
    /// Latest event time wins. Ties prefer an update over a delete, then fall
    /// back to event name and delay so the outcome never depends on input order.
    pub fn supersedes(&self, other: &ResourceChange) -> bool {
        let rank = |c: &ResourceChange| (c.event_time.clone(), !c.delete, c.event_name.clone(), c.delay);
        rank(self) > rank(other)
    }

    pub fn to_scan_entry(&self) -> ScanEntry {
        ScanEntry {
            aws_account_id: self.account_id.clone(),
            integration_id: self.integration_id.clone(),
            region: non_empty(&self.region),
            resource_id: non_empty(&self.resource_id),
            resource_type: self.resource_type.to_string(),
            scan_all_resources: self.is_scan_all(),
            next_page_token: None,
        }
    }

    pub fn to_delete_entry(&self) -> DeleteEntry {
        DeleteEntry {
            id: self.resource_id.clone(),
            resource_type: self.resource_type,
            account_id: self.account_id.clone(),
            region: self.region.clone(),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// One scan instruction on the scan request queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub aws_account_id: String,
    pub integration_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Kept as a string on the wire so one unknown type cannot poison a whole message
    pub resource_type: String,
    #[serde(default)]
    pub scan_all_resources: bool,
    /// Continuation marker for types polled in pages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Body of one scan request queue message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMsg {
    pub entries: Vec<ScanEntry>,
}

/// Indirection body for scan messages too large to inline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupKeyMsg {
    pub lookup_key: String,
}

/// Anything the poller may receive on the scan request queue
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueueBody {
    Lookup(LookupKeyMsg),
    Scan(ScanMsg),
}

/// Identity and tag fields shared by every resource snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHeader {
    pub id: String,
    pub resource_type: String,
    pub account_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ResourceHeader {
    pub fn new(id: impl Into<String>, resource_type: ResourceType, account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.to_string(),
            account_id: account_id.into(),
            region: region.into(),
            name: None,
            tags: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Normalized point-in-time state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub header: ResourceHeader,
    /// Type-specific payload
    pub attributes: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(header: ResourceHeader, attributes: serde_json::Value) -> Self {
        Self {
            header,
            attributes,
            last_updated: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// Snapshots without identity must never reach the inventory
    pub fn is_complete(&self) -> bool {
        !self.header.id.is_empty()
            && !self.header.resource_type.is_empty()
            && !self.header.account_id.is_empty()
    }
}

/// Inventory delete request for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEntry {
    pub id: String,
    pub resource_type: ResourceType,
    pub account_id: String,
    pub region: String,
}

/// Onboarded account registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub integration_id: String,
    pub account_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_scan_enabled")]
    pub scan_enabled: bool,
    /// Overrides the configured scan regions for this account
    #[serde(default)]
    pub regions: Vec<String>,
}

fn default_scan_enabled() -> bool {
    true
}
