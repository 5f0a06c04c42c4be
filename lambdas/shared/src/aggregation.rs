//! Per-batch change deduplication

use std::collections::HashMap;

use tracing::debug;

use crate::models::{ChangeKey, ResourceChange};

/// Keeps the latest change per (account, resource id, type, region) across one batch
#[derive(Debug, Default)]
pub struct ChangeAggregator {
    changes: HashMap<ChangeKey, ResourceChange>,
}

impl ChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, change: ResourceChange) {
        let key = change.key();
        match self.changes.get(&key) {
            Some(existing) if !change.supersedes(existing) => {
                debug!(account_id = %key.account_id, resource_id = %key.resource_id, event_name = %change.event_name, "Dropping superseded change");
            }
            _ => {
                self.changes.insert(key, change);
            }
        }
    }

    pub fn extend(&mut self, changes: impl IntoIterator<Item = ResourceChange>) {
        for change in changes {
            self.fold(change);
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Surviving changes, ordered by key so downstream output is stable
    pub fn into_changes(self) -> Vec<ResourceChange> {
        let mut changes: Vec<ResourceChange> = self.changes.into_values().collect();
        changes.sort_by(|a, b| {
            (&a.account_id, a.resource_type, &a.region, &a.resource_id).cmp(&(
                &b.account_id,
                b.resource_type,
                &b.region,
                &b.resource_id,
            ))
        });
        changes
    }
}
