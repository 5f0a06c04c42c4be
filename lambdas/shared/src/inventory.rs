//! Client side of the resource inventory API

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::models::{DeleteEntry, Snapshot};

/// The inventory is the system of record; both calls are bounded in size by the caller
#[async_trait]
pub trait InventoryApi: Send + Sync {
    async fn add_resources(&self, batch: &[Snapshot]) -> Result<()>;
    async fn delete_resources(&self, batch: &[DeleteEntry]) -> Result<()>;
}

#[derive(Serialize)]
struct AddResourcesRequest<'a> {
    resources: &'a [Snapshot],
}

#[derive(Serialize)]
struct DeleteResourcesRequest<'a> {
    resources: &'a [DeleteEntry],
}

/// JSON-over-HTTP inventory client
pub struct HttpInventoryClient {
    client: Client,
    base_url: String,
}

impl HttpInventoryClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("inventory http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send<B: Serialize + Sync>(&self, method: Method, body: &B) -> Result<()> {
        let url = format!("{}/resources", self.base_url);
        let resp = self
            .client
            .request(method.clone(), &url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Inventory(format!("{} {}: {}", method, url, e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            // Retrying a rejected payload cannot succeed
            return Err(Error::Internal(format!(
                "inventory rejected {} {}: {} - {}",
                method, url, status, text
            )));
        }
        Err(Error::Inventory(format!("{} {}: {} - {}", method, url, status, text)))
    }
}

#[async_trait]
impl InventoryApi for HttpInventoryClient {
    async fn add_resources(&self, batch: &[Snapshot]) -> Result<()> {
        self.send(Method::POST, &AddResourcesRequest { resources: batch }).await
    }

    async fn delete_resources(&self, batch: &[DeleteEntry]) -> Result<()> {
        self.send(Method::DELETE, &DeleteResourcesRequest { resources: batch }).await
    }
}
