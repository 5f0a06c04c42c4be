//! Test fixtures and utilities

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use uuid::Uuid;

pub const ACCOUNT_ID: &str = "123456789012";
pub const REGION: &str = "us-west-2";
pub const T0: &str = "2024-05-01T12:00:00Z";

/// Generate a unique bucket name for testing
pub fn unique_bucket() -> String {
    format!("test-bucket-{}", &Uuid::new_v4().to_string()[..8])
}

/// Generate a unique log object key for testing
pub fn unique_key() -> String {
    format!("AWSLogs/{}/CloudTrail/{}.json.gz", ACCOUNT_ID, &Uuid::new_v4().to_string()[..8])
}

/// A CloudTrail record for an S3 bucket API call
pub fn s3_event(account_id: &str, event_name: &str, bucket: &str, event_time: &str) -> Value {
    json!({
        "eventVersion": "1.08",
        "eventSource": "s3.amazonaws.com",
        "eventName": event_name,
        "eventTime": event_time,
        "awsRegion": REGION,
        "recipientAccountId": account_id,
        "requestParameters": {"bucketName": bucket},
    })
}

/// A CloudTrail record from a service nothing classifies
pub fn unmonitored_event(account_id: &str) -> Value {
    json!({
        "eventVersion": "1.08",
        "eventSource": "gamelift.amazonaws.com",
        "eventName": "CreateFleet",
        "eventTime": T0,
        "awsRegion": REGION,
        "recipientAccountId": account_id,
        "requestParameters": {"name": "fleet"},
    })
}

/// A Resource Groups Tagging API call naming resources by ARN
pub fn tag_event(account_id: &str, arns: &[&str]) -> Value {
    json!({
        "eventVersion": "1.08",
        "eventSource": "tagging.amazonaws.com",
        "eventName": "TagResources",
        "eventTime": T0,
        "awsRegion": REGION,
        "recipientAccountId": account_id,
        "requestParameters": {"resourceARNList": arns, "tags": {"team": "security"}},
    })
}

/// Wrap a record in an SNS notification
pub fn sns_notification(record: &Value) -> Value {
    json!({
        "Type": "Notification",
        "MessageId": Uuid::new_v4().to_string(),
        "TopicArn": format!("arn:aws:sns:{}:{}:cloudtrail", REGION, ACCOUNT_ID),
        "Message": record.to_string(),
    })
}

pub fn subscription_confirmation(subscribe_url: &str) -> Value {
    json!({
        "Type": "SubscriptionConfirmation",
        "TopicArn": format!("arn:aws:sns:{}:{}:cloudtrail", REGION, ACCOUNT_ID),
        "SubscribeURL": subscribe_url,
        "Message": "You have chosen to subscribe to the topic",
    })
}

/// S3 event notification announcing a delivered object; the key is sent form-encoded
pub fn object_created_notification(bucket: &str, encoded_key: &str) -> Value {
    json!({
        "Records": [{
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "s3": {
                "bucket": {"name": bucket},
                "object": {"key": encoded_key},
            },
        }],
    })
}

/// Notification CloudTrail itself sends after delivering log files
pub fn cloudtrail_delivery_notification(bucket: &str, keys: &[&str]) -> Value {
    json!({
        "s3Bucket": bucket,
        "s3ObjectKey": keys,
    })
}

/// A CloudTrail log file as delivered to S3
pub fn gzip_log(records: &[Value]) -> Vec<u8> {
    let doc = json!({ "Records": records }).to_string();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(doc.as_bytes()).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

pub fn bodies(values: &[Value]) -> Vec<String> {
    values.iter().map(Value::to_string).collect()
}
