//! Snapshot Core Library
//!
//! Shared functionality for the Snapshot Lambda functions:
//! - Envelope parsing, preprocessing and per-service event classification
//! - Per-batch change aggregation and dispatch to the scan request queue
//! - Resource pollers and the poller dispatcher
//! - Account directory cache, inventory client, DynamoDB tables
//! - Domain models, configuration and error types

pub mod aggregation;
pub mod arn;
pub mod classification;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod dynamo;
pub mod errors;
pub mod inventory;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod models;
pub mod polling;
pub mod processor;
pub mod queue;
pub mod retry;

pub use aggregation::ChangeAggregator;
pub use classification::envelope::{EnvelopeReader, HttpSubscriptionConfirmer, S3ObjectStore};
pub use classification::{preprocess, ClassifierRegistry, EventMetadata, Service};
pub use config::Config;
pub use directory::{AccountDirectory, IntegrationSource};
pub use dispatch::{ChangeDispatcher, DispatchSummary, ScanSubmitter};
pub use dynamo::DynamoClient;
pub use errors::{Error, Result};
pub use inventory::{HttpInventoryClient, InventoryApi};
pub use models::*;
pub use polling::dispatcher::PollSummary;
pub use polling::{PollContext, PollPage, Poller, PollerDispatcher, PollerRegistry};
pub use processor::{EventProcessor, ProcessSummary};
pub use queue::{ScanQueue, ScanRequestStore, SqsScanQueue};
pub use retry::RetryPolicy;
