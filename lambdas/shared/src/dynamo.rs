//! DynamoDB operations for Snapshot
//!
//! Two tables are touched:
//!
//! | Table        | PK                  | SK        | Purpose                          |
//! |--------------|---------------------|-----------|----------------------------------|
//! | integrations | INTEGRATION#{id}    | META      | Account directory entries        |
//! | lookup       | SCAN#{sha256}       | REQUEST   | Scan messages too large to queue |
//!
//! Lookup items carry an `expires_at` epoch attribute for DynamoDB TTL.

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_dynamo::{from_item, to_item};
use std::collections::HashMap;
use tracing::warn;

use crate::config::Config;
use crate::directory::IntegrationSource;
use crate::errors::{Error, Result};
use crate::models::Integration;
use crate::queue::ScanRequestStore;

/// Stored oversized scan request
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScanRequestItem {
    lookup_key: String,
    body: String,
    created_at: DateTime<Utc>,
    expires_at: i64,
}

/// DynamoDB client for the integrations and lookup tables
pub struct DynamoClient {
    client: Client,
    integrations_table: String,
    lookup_table: String,
    lookup_ttl_hours: i64,
}

impl DynamoClient {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            integrations_table: config.integrations_table.clone(),
            lookup_table: config.lookup_table.clone(),
            lookup_ttl_hours: config.lookup_ttl_hours,
        }
    }

    // =========================================================================
    // Integration Operations
    // =========================================================================

    /// Scan every integration record, following pagination
    pub async fn scan_integrations(&self) -> Result<Vec<Integration>> {
        let mut integrations = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let result = self
                .client
                .scan()
                .table_name(&self.integrations_table)
                .filter_expression("begins_with(PK, :prefix)")
                .expression_attribute_values(":prefix", AttributeValue::S("INTEGRATION#".to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

            for item in result.items.unwrap_or_default() {
                match from_item::<_, Integration>(item) {
                    Ok(integration) => integrations.push(integration),
                    Err(e) => warn!(error = %e, "Skipping malformed integration item"),
                }
            }

            match result.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        Ok(integrations)
    }

    // =========================================================================
    // Lookup Operations
    // =========================================================================

    async fn put_request(&self, key: &str, body: &str) -> Result<()> {
        let now = Utc::now();
        let record = ScanRequestItem {
            lookup_key: key.to_string(),
            body: body.to_string(),
            created_at: now,
            expires_at: (now + Duration::hours(self.lookup_ttl_hours)).timestamp(),
        };

        let mut item: HashMap<String, AttributeValue> =
            to_item(&record).map_err(|e| Error::DynamoSerialization(e.to_string()))?;
        item.insert("PK".to_string(), AttributeValue::S(format!("SCAN#{}", key)));
        item.insert("SK".to_string(), AttributeValue::S("REQUEST".to_string()));

        // Same key means same body, so overwriting is harmless
        self.client
            .put_item()
            .table_name(&self.lookup_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_request(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.lookup_table)
            .key("PK", AttributeValue::S(format!("SCAN#{}", key)))
            .key("SK", AttributeValue::S("REQUEST".to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match result.item {
            Some(item) => {
                let record: ScanRequestItem =
                    from_item(item).map_err(|e| Error::DynamoSerialization(e.to_string()))?;
                Ok(Some(record.body))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl IntegrationSource for DynamoClient {
    async fn list_integrations(&self) -> Result<Vec<Integration>> {
        self.scan_integrations().await
    }
}

#[async_trait]
impl ScanRequestStore for DynamoClient {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        self.put_request(key, body).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_request(key).await
    }
}
