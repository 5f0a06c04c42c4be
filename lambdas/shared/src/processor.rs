//! Event processing: ingestion queue bodies to dispatched changes

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregation::ChangeAggregator;
use crate::classification::envelope::EnvelopeReader;
use crate::classification::{preprocess, ClassifierRegistry};
use crate::directory::AccountDirectory;
use crate::dispatch::{ChangeDispatcher, DispatchSummary};
use crate::errors::{Error, Result};
use crate::models::ResourceChange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub messages: usize,
    pub records: usize,
    /// Bodies or records dropped before classification
    pub dropped: usize,
    pub changes: usize,
    pub dispatch: DispatchSummary,
}

pub struct EventProcessor {
    registry: ClassifierRegistry,
    directory: Arc<AccountDirectory>,
    reader: EnvelopeReader,
    dispatcher: ChangeDispatcher,
}

impl EventProcessor {
    pub fn new(
        registry: ClassifierRegistry,
        directory: Arc<AccountDirectory>,
        reader: EnvelopeReader,
        dispatcher: ChangeDispatcher,
    ) -> Self {
        Self {
            registry,
            directory,
            reader,
            dispatcher,
        }
    }

    /// Classify every record in the batch, deduplicate, then dispatch once.
    ///
    /// Bad bodies and records are logged and skipped. Directory and dispatch
    /// failures abort so the batch is redelivered.
    pub async fn process_batch(&self, bodies: &[String]) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        let mut aggregator = ChangeAggregator::new();

        for body in bodies {
            summary.messages += 1;
            let records = match self.reader.records(body).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, code = e.code(), "Dropping unreadable message");
                    summary.dropped += 1;
                    continue;
                }
            };

            for record in records {
                summary.records += 1;
                match self.classify_record(&record).await? {
                    Some(changes) => aggregator.extend(changes),
                    None => summary.dropped += 1,
                }
            }
        }

        summary.changes = aggregator.len();
        if aggregator.is_empty() {
            debug!(records = summary.records, "No changes in batch");
            return Ok(summary);
        }

        summary.dispatch = self.dispatcher.dispatch(aggregator.into_changes()).await?;
        info!(
            messages = summary.messages,
            records = summary.records,
            dropped = summary.dropped,
            changes = summary.changes,
            "Processed event batch"
        );
        Ok(summary)
    }

    /// `None` when the record is rejected before classification
    async fn classify_record(&self, record: &Value) -> Result<Option<Vec<ResourceChange>>> {
        let meta = match preprocess(record) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, event_name = ?record.get("eventName"), "Dropping event missing required fields");
                return Ok(None);
            }
        };

        // Unmonitored, failed and read-only calls never reach the directory
        let Some(service) = self.registry.admit(&meta) else {
            return Ok(Some(vec![]));
        };

        let integration = match self.directory.lookup(&meta.account_id).await {
            Ok(integration) => integration,
            Err(Error::UnauthorizedAccount(account)) => {
                warn!(
                    account_id = %account,
                    event_name = %meta.event_name,
                    event_source = %meta.event_source,
                    "Dropping event from unknown account"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut changes = service.classify(record, &meta);
        for change in &mut changes {
            change.integration_id = integration.integration_id.clone();
        }
        for change in &changes {
            debug!(
                account_id = %change.account_id,
                resource_type = %change.resource_type,
                resource_id = %change.resource_id,
                delete = change.delete,
                event_name = %change.event_name,
                "Classified change"
            );
        }
        Ok(Some(changes))
    }
}
