//! Inbound envelope parsing
//!
//! Messages on the ingestion queue arrive in one of these shapes:
//!
//! | Shape                              | Result                          |
//! |------------------------------------|---------------------------------|
//! | CloudTrail record                  | one record                      |
//! | `{"detail": record}` event wrapper | one record                      |
//! | SNS Notification around the above  | one record                      |
//! | S3 event notification              | objects to download and parse   |
//! | CloudTrail bucket notification     | objects to download and parse   |
//! | SNS SubscriptionConfirmation       | confirm, no records             |

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{Error, Result};

/// Location of a delivered log object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Records(Vec<Value>),
    Objects(Vec<ObjectRef>),
    SubscriptionConfirmation { topic_arn: String, subscribe_url: String },
}

pub fn parse_envelope(body: &str) -> Result<Envelope> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| Error::MalformedEnvelope(format!("not JSON: {}", e)))?;

    match value.get("Type").and_then(Value::as_str) {
        Some("SubscriptionConfirmation") => {
            let subscribe_url = value
                .get("SubscribeURL")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedEnvelope("confirmation without SubscribeURL".into()))?;
            Ok(Envelope::SubscriptionConfirmation {
                topic_arn: value.get("TopicArn").and_then(Value::as_str).unwrap_or_default().to_string(),
                subscribe_url: subscribe_url.to_string(),
            })
        }
        Some("Notification") => {
            let message = value
                .get("Message")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedEnvelope("notification without Message".into()))?;
            let inner: Value = serde_json::from_str(message)
                .map_err(|e| Error::MalformedEnvelope(format!("notification message not JSON: {}", e)))?;
            parse_inner(inner)
        }
        _ => parse_inner(value),
    }
}

fn parse_inner(value: Value) -> Result<Envelope> {
    if value.get("eventName").is_some() {
        return Ok(Envelope::Records(vec![value]));
    }

    if let Some(detail) = value.get("detail") {
        if detail.get("eventName").is_some() {
            return Ok(Envelope::Records(vec![detail.clone()]));
        }
    }

    // CloudTrail's own delivery notification
    if let (Some(bucket), Some(keys)) = (
        value.get("s3Bucket").and_then(Value::as_str),
        value.get("s3ObjectKey").and_then(Value::as_array),
    ) {
        let objects = keys
            .iter()
            .filter_map(Value::as_str)
            .map(|key| ObjectRef {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
            .collect();
        return Ok(Envelope::Objects(objects));
    }

    if let Some(records) = value.get("Records").and_then(Value::as_array) {
        let objects: Vec<ObjectRef> = records.iter().filter_map(s3_notification_object).collect();
        if !objects.is_empty() {
            return Ok(Envelope::Objects(objects));
        }
        let trail_records: Vec<Value> = records
            .iter()
            .filter(|r| r.get("eventName").is_some())
            .cloned()
            .collect();
        if !trail_records.is_empty() {
            return Ok(Envelope::Records(trail_records));
        }
    }

    Err(Error::MalformedEnvelope("unrecognized envelope shape".into()))
}

/// Object named by one `Records[]` entry of an S3 event notification
fn s3_notification_object(record: &Value) -> Option<ObjectRef> {
    let s3 = record.get("s3")?;
    let bucket = s3.pointer("/bucket/name")?.as_str()?;
    let key = s3.pointer("/object/key")?.as_str()?;
    Some(ObjectRef {
        bucket: bucket.to_string(),
        key: decode_object_key(key),
    })
}

/// S3 notifications form-encode object keys
pub fn decode_object_key(key: &str) -> String {
    let spaced = key.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            warn!(key = %key, error = %e, "Object key is not UTF-8 once decoded, using it verbatim");
            spaced
        }
    }
}

/// Records inside a downloaded log object (gzip or plain; one document or one record per line)
pub fn decode_log_object(bytes: &[u8]) -> Result<Vec<Value>> {
    let text = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut decoded)
            .map_err(|e| Error::Storage(format!("gzip decode: {}", e)))?;
        decoded
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };

    if let Ok(Value::Object(doc)) = serde_json::from_str::<Value>(&text) {
        if let Some(Value::Array(records)) = doc.get("Records") {
            return Ok(records.clone());
        }
        return Ok(vec![Value::Object(doc)]);
    }

    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unparseable log line"),
        }
    }
    Ok(records)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait SubscriptionConfirmer: Send + Sync {
    async fn confirm(&self, topic_arn: &str, subscribe_url: &str) -> Result<()>;
}

/// Expands envelopes into CloudTrail records, doing any I/O they require
pub struct EnvelopeReader {
    objects: Arc<dyn ObjectStore>,
    confirmer: Arc<dyn SubscriptionConfirmer>,
}

impl EnvelopeReader {
    pub fn new(objects: Arc<dyn ObjectStore>, confirmer: Arc<dyn SubscriptionConfirmer>) -> Self {
        Self { objects, confirmer }
    }

    /// Records carried by one queue message body.
    ///
    /// A malformed body is an error; a failed object download only drops that object.
    pub async fn records(&self, body: &str) -> Result<Vec<Value>> {
        match parse_envelope(body)? {
            Envelope::Records(records) => Ok(records),
            Envelope::SubscriptionConfirmation { topic_arn, subscribe_url } => {
                self.confirmer.confirm(&topic_arn, &subscribe_url).await?;
                info!(topic_arn = %topic_arn, "Confirmed SNS subscription");
                Ok(vec![])
            }
            Envelope::Objects(objects) => {
                let mut records = Vec::new();
                for object in objects {
                    let fetched = self.objects.get_object(&object.bucket, &object.key).await;
                    match fetched.and_then(|bytes| decode_log_object(&bytes)) {
                        Ok(mut r) => records.append(&mut r),
                        Err(e) => warn!(
                            bucket = %object.bucket,
                            key = %object.key,
                            error = %e,
                            "Failed to read log object"
                        ),
                    }
                }
                Ok(records)
            }
        }
    }
}

/// Log objects read from S3
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("GetObject s3://{}/{}: {}", bucket, key, e)))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Storage(format!("read s3://{}/{}: {}", bucket, key, e)))?;
        Ok(data.into_bytes().to_vec())
    }
}

/// Confirms SNS subscriptions by visiting the SubscribeURL
pub struct HttpSubscriptionConfirmer {
    client: reqwest::Client,
}

impl HttpSubscriptionConfirmer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSubscriptionConfirmer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionConfirmer for HttpSubscriptionConfirmer {
    async fn confirm(&self, topic_arn: &str, subscribe_url: &str) -> Result<()> {
        let resp = self
            .client
            .get(subscribe_url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("confirm subscription to {}: {}", topic_arn, e)))?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "confirm subscription to {}: {}",
                topic_arn,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;

    fn trail_record() -> Value {
        json!({
            "eventSource": "s3.amazonaws.com",
            "eventName": "DeleteBucket",
            "awsRegion": "us-west-2",
            "recipientAccountId": "123456789012",
            "requestParameters": {"bucketName": "panther"},
        })
    }

    fn sns(message: &Value) -> String {
        json!({"Type": "Notification", "TopicArn": "arn:aws:sns:us-west-2:1:t", "Message": message.to_string()}).to_string()
    }

    #[test]
    fn test_direct_and_wrapped_records() {
        let record = trail_record();
        assert_eq!(
            parse_envelope(&record.to_string()).unwrap(),
            Envelope::Records(vec![record.clone()])
        );
        assert_eq!(parse_envelope(&sns(&record)).unwrap(), Envelope::Records(vec![record.clone()]));
        assert_eq!(
            parse_envelope(&sns(&json!({"detail": record}))).unwrap(),
            Envelope::Records(vec![record])
        );
    }

    #[test]
    fn test_s3_notifications() {
        let generic = json!({"Records": [{"s3": {"bucket": {"name": "logs"}, "object": {"key": "a/b+c%3D.json.gz"}}}]});
        assert_eq!(
            parse_envelope(&sns(&generic)).unwrap(),
            Envelope::Objects(vec![ObjectRef { bucket: "logs".into(), key: "a/b c=.json.gz".into() }])
        );

        let trail = json!({"s3Bucket": "trail-logs", "s3ObjectKey": ["k1", "k2"]});
        match parse_envelope(&sns(&trail)).unwrap() {
            Envelope::Objects(objects) => assert_eq!(objects.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subscription_confirmation() {
        let body = json!({
            "Type": "SubscriptionConfirmation",
            "TopicArn": "arn:aws:sns:us-west-2:1:t",
            "SubscribeURL": "https://sns.example/confirm",
        });
        assert!(matches!(
            parse_envelope(&body.to_string()).unwrap(),
            Envelope::SubscriptionConfirmation { .. }
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(parse_envelope("nope"), Err(Error::MalformedEnvelope(_))));
        assert!(matches!(parse_envelope(r#"{"hello": 1}"#), Err(Error::MalformedEnvelope(_))));
    }

    #[test]
    fn test_decode_key_edge_cases() {
        assert_eq!(decode_object_key("100%"), "100%");
        assert_eq!(decode_object_key("%zz"), "%zz");
        assert_eq!(decode_object_key("%41"), "A");
        assert_eq!(decode_object_key("logs/a+b%2Bc%3D.json.gz"), "logs/a b+c=.json.gz");
        assert_eq!(decode_object_key("caf%C3%A9"), "café");
        assert_eq!(decode_object_key("bad%FF+key"), "bad%FF key");
    }

    #[test]
    fn test_decode_gzip_document_and_lines() {
        let doc = json!({"Records": [trail_record(), trail_record()]}).to_string();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(doc.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(decode_log_object(&gz).unwrap().len(), 2);

        let lines = format!("{}\nnot json\n\n{}\n", trail_record(), trail_record());
        assert_eq!(decode_log_object(lines.as_bytes()).unwrap().len(), 2);
    }

    struct MapStore(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ObjectStore for MapStore {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.0
                .get(&format!("{}/{}", bucket, key))
                .cloned()
                .ok_or_else(|| Error::Storage("NoSuchKey".into()))
        }
    }

    #[derive(Default)]
    struct RecordingConfirmer(Mutex<Vec<String>>);

    #[async_trait]
    impl SubscriptionConfirmer for RecordingConfirmer {
        async fn confirm(&self, _topic_arn: &str, subscribe_url: &str) -> Result<()> {
            self.0.lock().unwrap().push(subscribe_url.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reader_downloads_objects_and_skips_missing() {
        let mut objects = HashMap::new();
        objects.insert("logs/present".to_string(), trail_record().to_string().into_bytes());
        let confirmer = Arc::new(RecordingConfirmer::default());
        let reader = EnvelopeReader::new(Arc::new(MapStore(objects)), confirmer.clone());

        let body = sns(&json!({"s3Bucket": "logs", "s3ObjectKey": ["present", "missing"]}));
        let records = reader.records(&body).await.unwrap();
        assert_eq!(records.len(), 1);

        let confirm = json!({"Type": "SubscriptionConfirmation", "SubscribeURL": "https://x"}).to_string();
        assert!(reader.records(&confirm).await.unwrap().is_empty());
        assert_eq!(confirmer.0.lock().unwrap().as_slice(), ["https://x".to_string()]);
    }
}
