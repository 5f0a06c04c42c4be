//! Envelope-field extraction that runs before any classifier

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::models::{ResourceChange, ResourceType};

/// Common fields of one audit-log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub account_id: String,
    pub region: String,
    pub event_name: String,
    pub event_source: String,
    /// Normalized so that string order is time order
    pub event_time: String,
    pub error_code: Option<String>,
}

/// Extract and validate the envelope fields of a CloudTrail record.
///
/// Account id, region and event name are required; anything else is best effort.
pub fn preprocess(record: &Value) -> Result<EventMetadata> {
    let account_id = str_field(record, "recipientAccountId")
        .or_else(|| record.pointer("/userIdentity/accountId").and_then(non_empty_str))
        .ok_or(Error::MissingField("recipientAccountId"))?;
    let region = str_field(record, "awsRegion").ok_or(Error::MissingField("awsRegion"))?;
    let event_name = str_field(record, "eventName").ok_or(Error::MissingField("eventName"))?;

    Ok(EventMetadata {
        account_id: account_id.to_string(),
        region: region.to_string(),
        event_name: event_name.to_string(),
        event_source: str_field(record, "eventSource").unwrap_or_default().to_string(),
        event_time: str_field(record, "eventTime").map(normalize_time).unwrap_or_default(),
        error_code: str_field(record, "errorCode").map(str::to_string),
    })
}

/// Re-emit an RFC3339 timestamp as fixed-width UTC with millisecond precision.
/// Unparseable input is kept verbatim.
pub fn normalize_time(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true),
        Err(_) => raw.to_string(),
    }
}

fn str_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(non_empty_str)
}

fn non_empty_str(v: &Value) -> Option<&str> {
    v.as_str().filter(|s| !s.is_empty())
}

impl EventMetadata {
    fn base(&self, resource_type: ResourceType, resource_id: String, region: String) -> ResourceChange {
        ResourceChange {
            account_id: self.account_id.clone(),
            region,
            resource_id,
            resource_type,
            integration_id: String::new(),
            delete: false,
            event_name: self.event_name.clone(),
            event_time: self.event_time.clone(),
            delay: 0,
        }
    }

    /// Rescan of one resource in the event's region
    pub fn change(&self, resource_type: ResourceType, resource_id: impl Into<String>) -> ResourceChange {
        self.base(resource_type, resource_id.into(), self.region.clone())
    }

    /// Inventory delete of one resource
    pub fn delete(&self, resource_type: ResourceType, resource_id: impl Into<String>) -> ResourceChange {
        let mut change = self.change(resource_type, resource_id);
        change.delete = true;
        change
    }

    /// Rescan of every resource of a type in the event's region.
    ///
    /// CloudTrail scans always cover the account: the same poll rebuilds the
    /// account-wide trail summary, which a single region cannot describe.
    pub fn region_scan(&self, resource_type: ResourceType) -> ResourceChange {
        if resource_type == ResourceType::CloudTrail {
            return self.account_scan(resource_type);
        }
        self.base(resource_type, String::new(), self.region.clone())
    }

    /// Rescan of every resource of a type across the account
    pub fn account_scan(&self, resource_type: ResourceType) -> ResourceChange {
        self.base(resource_type, String::new(), String::new())
    }
}
