//! Snapshot Poller Lambda
//!
//! Triggered by the scan request SQS queue. Each message is a `ScanMsg` (or
//! a lookup key for one stored in DynamoDB). Every entry is polled by the
//! poller registered for its resource type and the resulting snapshots are
//! written to the inventory.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_lambda_events::event::sqs::SqsEvent;
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use snapshot_core::{
    AccountDirectory, Config, DynamoClient, HttpInventoryClient, PollerDispatcher, PollerRegistry, ScanSubmitter,
    SqsScanQueue,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn handler(dispatcher: &PollerDispatcher, event: LambdaEvent<SqsEvent>) -> Result<(), LambdaError> {
    let (payload, _context) = event.into_parts();
    let bodies: Vec<String> = payload.records.into_iter().filter_map(|r| r.body).collect();

    info!(record_count = bodies.len(), "Processing scan batch");

    match dispatcher.handle_batch(&bodies).await {
        Ok(summary) => {
            info!(
                entries = summary.entries,
                snapshots = summary.snapshots,
                continuations = summary.continuations,
                "Scan batch complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, code = e.code(), "Failed to process scan batch");
            Err(e.into())
        }
    }
}

async fn build_dispatcher(config: &Config) -> Result<PollerDispatcher, LambdaError> {
    let sdk = aws_config::load_defaults(BehaviorVersion::latest()).await;

    let dynamo = Arc::new(DynamoClient::new(aws_sdk_dynamodb::Client::new(&sdk), config));
    let queue = Arc::new(SqsScanQueue::new(aws_sdk_sqs::Client::new(&sdk), &config.scan_queue_url));
    let inventory = Arc::new(HttpInventoryClient::new(&config.inventory_api_url)?);
    let registry = PollerRegistry::aws(&sdk);

    info!(pollers = registry.len(), regions = ?config.scan_regions, "Poller registry ready");

    let submitter = ScanSubmitter::new(queue, dynamo.clone(), config);
    let directory = Arc::new(AccountDirectory::new(dynamo.clone(), config.directory_ttl));
    Ok(PollerDispatcher::new(registry, inventory, dynamo, submitter, config).with_directory(directory))
}

#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .with_target(false)
        .without_time()
        .init();

    let config = Config::from_env()?;
    config.require_endpoints()?;

    let dispatcher = Arc::new(build_dispatcher(&config).await?);

    run(service_fn(move |event: LambdaEvent<SqsEvent>| {
        let dispatcher = dispatcher.clone();
        async move { handler(&dispatcher, event).await }
    }))
    .await
}
