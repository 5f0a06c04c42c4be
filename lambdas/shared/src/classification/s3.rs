//! S3 bucket classifier

use serde_json::Value;

use super::{missing_target, str_at, unknown_event, EventMetadata};
use crate::arn::s3_bucket_arn;
use crate::models::{ResourceChange, ResourceType};

/// Bucket-configuration mutations that warrant a rescan of the bucket
const BUCKET_MUTATIONS: &[&str] = &[
    "CreateBucket",
    "PutBucketAcl",
    "PutBucketPolicy",
    "DeleteBucketPolicy",
    "PutBucketPublicAccessBlock",
    "DeleteBucketPublicAccessBlock",
    "PutBucketEncryption",
    "DeleteBucketEncryption",
    "PutBucketVersioning",
    "PutBucketLogging",
    "PutBucketTagging",
    "DeleteBucketTagging",
    "PutBucketLifecycle",
    "PutBucketLifecycleConfiguration",
    "DeleteBucketLifecycle",
    "PutBucketReplication",
    "DeleteBucketReplication",
    "PutBucketCors",
    "DeleteBucketCors",
    "PutBucketWebsite",
    "DeleteBucketWebsite",
    "PutBucketNotification",
    "PutBucketNotificationConfiguration",
    "PutBucketOwnershipControls",
    "DeleteBucketOwnershipControls",
    "PutBucketObjectLockConfiguration",
    "PutBucketRequestPayment",
    "PutBucketAccelerateConfiguration",
];

/// Object-level data events; they never change bucket posture
const IGNORED: &[&str] = &[
    "PutObject",
    "CopyObject",
    "DeleteObject",
    "DeleteObjects",
    "RestoreObject",
    "PutObjectAcl",
    "PutObjectTagging",
    "DeleteObjectTagging",
    "PutObjectRetention",
    "PutObjectLegalHold",
    "CreateMultipartUpload",
    "UploadPart",
    "UploadPartCopy",
    "CompleteMultipartUpload",
    "AbortMultipartUpload",
    "SelectObjectContent",
];

pub fn classify(record: &Value, meta: &EventMetadata) -> Vec<ResourceChange> {
    let event = meta.event_name.as_str();

    if IGNORED.contains(&event) {
        return vec![];
    }

    // Account-level block overrides every bucket's effective public access
    if event == "PutAccountPublicAccessBlock" || event == "DeleteAccountPublicAccessBlock" {
        return vec![meta.account_scan(ResourceType::S3Bucket)];
    }

    if event != "DeleteBucket" && !BUCKET_MUTATIONS.contains(&event) {
        return unknown_event(meta);
    }

    let Some(bucket) = str_at(record, "/requestParameters/bucketName") else {
        return missing_target(meta, "requestParameters.bucketName");
    };
    let id = s3_bucket_arn(bucket);

    if event == "DeleteBucket" {
        vec![meta.delete(ResourceType::S3Bucket, id)]
    } else {
        vec![meta.change(ResourceType::S3Bucket, id)]
    }
}
