//! Snapshot Processor Lambda
//!
//! Triggered by the ingestion SQS queue. Each message body is a CloudTrail
//! record, an SNS notification wrapping one, or a pointer to delivered log
//! objects. Records are classified into resource changes, deduplicated per
//! batch, then deleted from the inventory or queued for rescanning.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_lambda_events::event::sqs::SqsEvent;
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use snapshot_core::{
    AccountDirectory, ChangeDispatcher, ClassifierRegistry, Config, DynamoClient, EnvelopeReader, EventProcessor,
    HttpInventoryClient, HttpSubscriptionConfirmer, S3ObjectStore, ScanSubmitter, SqsScanQueue,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

async fn handler(processor: &EventProcessor, event: LambdaEvent<SqsEvent>) -> Result<(), LambdaError> {
    let (payload, _context) = event.into_parts();

    let total = payload.records.len();
    let bodies: Vec<String> = payload.records.into_iter().filter_map(|r| r.body).collect();
    if bodies.len() < total {
        warn!(skipped = total - bodies.len(), "Skipping SQS records without a body");
    }

    info!(record_count = bodies.len(), "Processing ingestion batch");

    match processor.process_batch(&bodies).await {
        Ok(summary) => {
            info!(
                changes = summary.changes,
                deleted = summary.dispatch.deleted,
                scan_messages = summary.dispatch.messages,
                "Ingestion batch complete"
            );
            Ok(())
        }
        Err(e) => {
            // Returning the error makes SQS redeliver the whole batch
            error!(error = %e, code = e.code(), "Failed to process ingestion batch");
            Err(e.into())
        }
    }
}

async fn build_processor(config: &Config) -> Result<EventProcessor, LambdaError> {
    let sdk = aws_config::load_defaults(BehaviorVersion::latest()).await;

    let dynamo = Arc::new(DynamoClient::new(aws_sdk_dynamodb::Client::new(&sdk), config));
    let queue = Arc::new(SqsScanQueue::new(aws_sdk_sqs::Client::new(&sdk), &config.scan_queue_url));
    let inventory = Arc::new(HttpInventoryClient::new(&config.inventory_api_url)?);

    let submitter = ScanSubmitter::new(queue, dynamo.clone(), config);
    let dispatcher = ChangeDispatcher::new(inventory, submitter, config);
    let directory = Arc::new(AccountDirectory::new(dynamo, config.directory_ttl));
    let reader = EnvelopeReader::new(
        Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&sdk))),
        Arc::new(HttpSubscriptionConfirmer::new()),
    );

    Ok(EventProcessor::new(ClassifierRegistry::standard(), directory, reader, dispatcher))
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

    // Built once so the account directory cache survives warm invocations
    let processor = Arc::new(build_processor(&config).await?);

    run(service_fn(move |event: LambdaEvent<SqsEvent>| {
        let processor = processor.clone();
        async move { handler(&processor, event).await }
    }))
    .await
}
