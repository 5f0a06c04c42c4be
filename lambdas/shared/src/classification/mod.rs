//! Audit-event classification
//!
//! Turns one CloudTrail record into the `ResourceChange`s it implies. The
//! registry maps an `eventSource` to a `Service`; each service owns a pure
//! classifier function over (record, metadata).

pub mod cloudtrail;
pub mod dynamodb;
pub mod ecs;
pub mod envelope;
pub mod preprocess;
pub mod s3;
pub mod sqs;
pub mod tagging;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::models::ResourceChange;

pub use preprocess::{preprocess, EventMetadata};

/// Event-name prefixes of calls that cannot mutate state
pub const READ_ONLY_PREFIXES: &[&str] = &["Get", "List", "Describe", "Head", "Lookup"];

/// Monitored source services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    S3,
    DynamoDb,
    CloudTrail,
    Sqs,
    Ecs,
    Tagging,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::S3,
        Service::DynamoDb,
        Service::CloudTrail,
        Service::Sqs,
        Service::Ecs,
        Service::Tagging,
    ];

    pub fn event_source(&self) -> &'static str {
        match self {
            Service::S3 => "s3.amazonaws.com",
            Service::DynamoDb => "dynamodb.amazonaws.com",
            Service::CloudTrail => "cloudtrail.amazonaws.com",
            Service::Sqs => "sqs.amazonaws.com",
            Service::Ecs => "ecs.amazonaws.com",
            Service::Tagging => "tagging.amazonaws.com",
        }
    }

    /// Runs this service's classifier with no admission checks
    pub fn classify(&self, record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
        match self {
            Service::S3 => s3::classify(record, meta),
            Service::DynamoDb => dynamodb::classify(record, meta),
            Service::CloudTrail => cloudtrail::classify(record, meta),
            Service::Sqs => sqs::classify(record, meta),
            Service::Ecs => ecs::classify(record, meta),
            Service::Tagging => tagging::classify(record, meta),
        }
    }
}

/// Registry of monitored services, built once per process
#[derive(Debug, Clone)]
pub struct ClassifierRegistry {
    services: HashMap<&'static str, Service>,
    /// Read-only-looking event names that still reach their classifier
    read_only_exceptions: HashSet<String>,
}

impl ClassifierRegistry {
    /// Every service this crate knows how to classify
    pub fn standard() -> Self {
        Self::with_services(&Service::ALL)
    }

    pub fn with_services(services: &[Service]) -> Self {
        Self {
            services: services.iter().map(|s| (s.event_source(), *s)).collect(),
            read_only_exceptions: HashSet::new(),
        }
    }

    pub fn with_read_only_exception(mut self, event_name: impl Into<String>) -> Self {
        self.read_only_exceptions.insert(event_name.into());
        self
    }

    pub fn service_for(&self, event_source: &str) -> Option<Service> {
        self.services.get(event_source).copied()
    }

    /// Changes implied by one preprocessed record.
    ///
    /// Unmonitored sources, failed calls and read-only calls yield nothing.
    pub fn classify(&self, record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
        match self.admit(meta) {
            Some(service) => service.classify(record, meta),
            None => vec![],
        }
    }

    /// The service whose classifier should see this event, if any
    pub fn admit(&self, meta: &EventMetadata) -> Option<Service> {
        let Some(service) = self.service_for(&meta.event_source) else {
            debug!(event_source = %meta.event_source, event_name = %meta.event_name, "Unmonitored event source");
            return None;
        };

        if let Some(code) = &meta.error_code {
            debug!(event_name = %meta.event_name, error_code = %code, "Skipping failed API call");
            return None;
        }

        if is_read_only(&meta.event_name) && !self.read_only_exceptions.contains(&meta.event_name) {
            debug!(event_name = %meta.event_name, "Skipping read-only API call");
            return None;
        }

        Some(service)
    }
}

pub fn is_read_only(event_name: &str) -> bool {
    READ_ONLY_PREFIXES.iter().any(|p| event_name.starts_with(p))
}

/// String at a JSON pointer, if present and non-empty
pub(crate) fn str_at<'a>(record: &'a Value, pointer: &str) -> Option<&'a str> {
    record.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Log-and-learn: providers add API calls faster than classifiers do
pub(crate) fn unknown_event(meta: &EventMetadata) -> Vec<ResourceChange> {
    warn!(
        event_source = %meta.event_source,
        event_name = %meta.event_name,
        account_id = %meta.account_id,
        "Unknown event name for monitored service"
    );
    vec![]
}

/// A mutation whose target could not be read from the record
pub(crate) fn missing_target(meta: &EventMetadata, field: &str) -> Vec<ResourceChange> {
    warn!(
        event_name = %meta.event_name,
        account_id = %meta.account_id,
        field = field,
        "Event is missing its target resource"
    );
    vec![]
}
