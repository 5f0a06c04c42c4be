//! End-to-end pipeline tests
//!
//! Run with: cargo test -p snapshot-integration-tests

use pretty_assertions::assert_eq;
use serde_json::json;
use snapshot_core::memory::MemoryScanQueue;
use snapshot_core::polling::cloudtrail::TrailInfo;
use snapshot_core::{Config, ScanMsg};
use snapshot_integration_tests::fixtures::*;
use snapshot_integration_tests::pipeline::Pipeline;

fn scan_msg(body: &str) -> ScanMsg {
    serde_json::from_str(body).expect("scan message")
}

// ===== Ingestion Tests =====

#[tokio::test]
async fn test_direct_and_sns_wrapped_duplicates_collapse() {
    let pipeline = Pipeline::new();
    let record = s3_event(ACCOUNT_ID, "PutBucketPublicAccessBlock", "panther", T0);

    let summary = pipeline
        .ingest(&bodies(&[record.clone(), sns_notification(&record)]))
        .await
        .expect("ingest");

    assert_eq!(summary.records, 2);
    assert_eq!(summary.changes, 1);
    assert_eq!(summary.dispatch.scan_entries, 1);
    assert_eq!(summary.dispatch.messages, 1);
    assert_eq!(summary.dispatch.deleted, 0);

    let sent = pipeline.scan_bodies();
    assert_eq!(sent.len(), 1);
    let msg = scan_msg(&sent[0]);
    assert_eq!(msg.entries.len(), 1);
    assert_eq!(msg.entries[0].resource_type, "AWS.S3.Bucket");
    assert_eq!(msg.entries[0].resource_id.as_deref(), Some("arn:aws:s3:::panther"));
    assert!(pipeline.inventory.deleted().is_empty());
}

#[tokio::test]
async fn test_delete_bucket_goes_to_inventory_delete_path() {
    let pipeline = Pipeline::new();

    let summary = pipeline
        .ingest(&bodies(&[s3_event(ACCOUNT_ID, "DeleteBucket", "panther", T0)]))
        .await
        .expect("ingest");

    assert_eq!(summary.dispatch.deleted, 1);
    assert!(pipeline.scan_bodies().is_empty());

    let deleted = pipeline.inventory.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].id, "arn:aws:s3:::panther");
    assert_eq!(deleted[0].account_id, ACCOUNT_ID);
}

#[tokio::test]
async fn test_unrecognized_source_yields_nothing() {
    let pipeline = Pipeline::new();

    let summary = pipeline
        .ingest(&bodies(&[unmonitored_event(ACCOUNT_ID)]))
        .await
        .expect("ingest");

    assert_eq!(summary.changes, 0);
    assert!(pipeline.scan_bodies().is_empty());
    assert!(pipeline.inventory.deleted().is_empty());
}

#[tokio::test]
async fn test_unknown_account_is_dropped_before_classification() {
    let pipeline = Pipeline::new();

    let summary = pipeline
        .ingest(&bodies(&[s3_event("999999999999", "DeleteBucket", "not-ours", T0)]))
        .await
        .expect("ingest");

    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.changes, 0);
    assert!(pipeline.inventory.deleted().is_empty());
    assert!(pipeline.scan_bodies().is_empty());
}

#[tokio::test]
async fn test_later_delete_supersedes_earlier_update() {
    let pipeline = Pipeline::new();
    let bucket = unique_bucket();

    let summary = pipeline
        .ingest(&bodies(&[
            s3_event(ACCOUNT_ID, "DeleteBucket", &bucket, "2024-05-01T12:05:00Z"),
            s3_event(ACCOUNT_ID, "PutBucketPolicy", &bucket, T0),
        ]))
        .await
        .expect("ingest");

    assert_eq!(summary.changes, 1);
    assert_eq!(summary.dispatch.deleted, 1);
    assert!(pipeline.scan_bodies().is_empty());
}

#[tokio::test]
async fn test_redelivered_batch_is_idempotent_per_batch() {
    let pipeline = Pipeline::new();
    let record = s3_event(ACCOUNT_ID, "PutBucketEncryption", "logs", T0);
    let batch = bodies(&[record.clone(), record.clone(), sns_notification(&record)]);

    let first = pipeline.ingest(&batch).await.expect("first");
    let second = pipeline.ingest(&batch).await.expect("second");

    assert_eq!(first.changes, 1);
    assert_eq!(second.changes, 1);
    assert_eq!(scan_msg(&pipeline.scan_bodies()[0]), scan_msg(&pipeline.scan_bodies()[1]));
}

#[tokio::test]
async fn test_malformed_bodies_do_not_block_batch() {
    let pipeline = Pipeline::new();
    let batch = vec![
        "not json".to_string(),
        json!({"hello": "world"}).to_string(),
        s3_event(ACCOUNT_ID, "PutBucketPolicy", "logs", T0).to_string(),
    ];

    let summary = pipeline.ingest(&batch).await.expect("ingest");

    assert_eq!(summary.dropped, 2);
    assert_eq!(summary.changes, 1);
}

#[tokio::test]
async fn test_subscription_confirmation_is_confirmed() {
    let pipeline = Pipeline::new();
    let url = "https://sns.us-west-2.amazonaws.com/?Action=ConfirmSubscription&Token=abc";

    let summary = pipeline
        .ingest(&bodies(&[subscription_confirmation(url)]))
        .await
        .expect("ingest");

    assert_eq!(summary.changes, 0);
    assert_eq!(pipeline.confirmer.confirmed(), vec![url.to_string()]);
}

// ===== Log Object Tests =====

#[tokio::test]
async fn test_gzip_log_object_from_s3_notification() {
    let pipeline = Pipeline::new();
    let key = "AWSLogs/123456789012/CloudTrail/us-west-2/2024/05/01/log file.json.gz";
    pipeline.objects.insert(
        "trail-logs",
        key,
        gzip_log(&[
            s3_event(ACCOUNT_ID, "PutBucketPolicy", "alpha", T0),
            s3_event(ACCOUNT_ID, "DeleteBucket", "beta", T0),
        ]),
    );
    let encoded = key.replace(' ', "+");

    let summary = pipeline
        .ingest(&bodies(&[sns_notification(&object_created_notification("trail-logs", &encoded))]))
        .await
        .expect("ingest");

    assert_eq!(summary.records, 2);
    assert_eq!(summary.dispatch.deleted, 1);
    assert_eq!(summary.dispatch.scan_entries, 1);
    assert_eq!(pipeline.inventory.deleted()[0].id, "arn:aws:s3:::beta");
}

#[tokio::test]
async fn test_missing_log_object_is_skipped() {
    let pipeline = Pipeline::new();
    let present = unique_key();
    pipeline.objects.insert(
        "trail-logs",
        &present,
        gzip_log(&[s3_event(ACCOUNT_ID, "PutBucketVersioning", "gamma", T0)]),
    );
    let missing = unique_key();

    let summary = pipeline
        .ingest(&bodies(&[cloudtrail_delivery_notification(
            "trail-logs",
            &[missing.as_str(), present.as_str()],
        )]))
        .await
        .expect("ingest");

    assert_eq!(summary.records, 1);
    assert_eq!(summary.changes, 1);
}

// ===== Polling Tests =====

#[tokio::test]
async fn test_scan_request_polls_bucket_into_inventory() {
    let pipeline = Pipeline::new();
    pipeline.buckets.add("panther", REGION);

    pipeline
        .ingest(&bodies(&[s3_event(ACCOUNT_ID, "PutBucketPublicAccessBlock", "panther", T0)]))
        .await
        .expect("ingest");
    let summary = pipeline.poll_from(0).await.expect("poll");

    assert_eq!(summary.entries, 1);
    assert_eq!(summary.snapshots, 1);

    let added = pipeline.inventory.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].id(), "arn:aws:s3:::panther");
    assert_eq!(added[0].header.region, REGION);
    assert_eq!(added[0].header.account_id, ACCOUNT_ID);
    assert_eq!(added[0].attributes["publicAccessBlock"]["blockPublicPolicy"], json!(true));
}

#[tokio::test]
async fn test_type_without_poller_does_not_block_message() {
    let pipeline = Pipeline::new();
    pipeline.buckets.add("panther", REGION);
    let body = json!({
        "entries": [
            {
                "awsAccountId": ACCOUNT_ID,
                "integrationId": "int-123456789012",
                "region": REGION,
                "resourceId": format!("arn:aws:kms:{}:{}:key/abc", REGION, ACCOUNT_ID),
                "resourceType": "AWS.KMS.Key",
                "scanAllResources": false,
            },
            {
                "awsAccountId": ACCOUNT_ID,
                "integrationId": "int-123456789012",
                "region": REGION,
                "resourceId": "arn:aws:s3:::panther",
                "resourceType": "AWS.S3.Bucket",
                "scanAllResources": false,
            },
        ]
    })
    .to_string();

    let summary = pipeline.poller.handle_batch(&[body]).await.expect("poll");

    assert_eq!(summary.entries, 2);
    assert_eq!(summary.failed_entries, 1);
    assert_eq!(summary.snapshots, 1);
    assert_eq!(pipeline.inventory.added()[0].id(), "arn:aws:s3:::panther");
}

#[tokio::test]
async fn test_vanished_bucket_is_skipped() {
    let pipeline = Pipeline::new();
    pipeline.buckets.add("short-lived", REGION);

    pipeline
        .ingest(&bodies(&[s3_event(ACCOUNT_ID, "PutBucketTagging", "short-lived", T0)]))
        .await
        .expect("ingest");
    pipeline.buckets.remove("short-lived");
    let summary = pipeline.poll_from(0).await.expect("poll");

    assert_eq!(summary.entries, 1);
    assert_eq!(summary.snapshots, 0);
    assert!(pipeline.inventory.added().is_empty());
}

#[tokio::test]
async fn test_scan_all_collects_every_page() {
    let pipeline = Pipeline::new();
    for name in ["a-one", "b-two", "c-three", "d-four", "e-five"] {
        pipeline.buckets.add(name, REGION);
    }
    pipeline.buckets.add("f-elsewhere", "ap-east-1");
    let body = json!({
        "entries": [{
            "awsAccountId": ACCOUNT_ID,
            "integrationId": "int-123456789012",
            "resourceType": "AWS.S3.Bucket",
            "scanAllResources": true,
        }]
    })
    .to_string();

    let summary = pipeline.poller.handle_batch(&[body]).await.expect("poll");

    assert_eq!(summary.snapshots, 5);
    let mut ids: Vec<String> = pipeline.inventory.added().iter().map(|s| s.id().to_string()).collect();
    ids.sort();
    assert_eq!(
        ids,
        vec![
            "arn:aws:s3:::a-one",
            "arn:aws:s3:::b-two",
            "arn:aws:s3:::c-three",
            "arn:aws:s3:::d-four",
            "arn:aws:s3:::e-five",
        ]
    );
}

#[tokio::test]
async fn test_oversize_scan_message_travels_by_lookup_key() {
    let config = Config {
        max_message_bytes: 400,
        ..Config::default()
    };
    let pipeline = Pipeline::with_queue(MemoryScanQueue::new(), config);
    let names: Vec<String> = (0..6).map(|_| unique_bucket()).collect();
    for name in &names {
        pipeline.buckets.add(name, REGION);
    }
    let records: Vec<_> = names
        .iter()
        .map(|name| s3_event(ACCOUNT_ID, "PutBucketPolicy", name, T0))
        .collect();

    let ingested = pipeline.ingest(&bodies(&records)).await.expect("ingest");
    assert_eq!(ingested.dispatch.indirected, 1);
    assert_eq!(pipeline.store.len(), 1);
    assert!(pipeline.scan_bodies()[0].contains("lookupKey"));

    let polled = pipeline.poll_from(0).await.expect("poll");
    assert_eq!(polled.entries, 6);
    assert_eq!(polled.snapshots, 6);
}

#[tokio::test]
async fn test_tag_fallback_keeps_trail_summary_account_wide() {
    let pipeline = Pipeline::new();
    pipeline.trails.add(TrailInfo {
        arn: format!("arn:aws:cloudtrail:us-east-1:{}:trail/org", ACCOUNT_ID),
        name: "org".to_string(),
        home_region: "us-east-1".to_string(),
        is_multi_region: true,
        is_organization_trail: true,
        log_file_validation: true,
        ..TrailInfo::default()
    });

    let instance = format!("arn:aws:ec2:{}:{}:instance/i-1", REGION, ACCOUNT_ID);
    pipeline
        .ingest(&bodies(&[tag_event(ACCOUNT_ID, &[instance.as_str()])]))
        .await
        .expect("ingest");
    pipeline.poll_from(0).await.expect("poll");

    let added = pipeline.inventory.added();
    let meta = added
        .iter()
        .find(|s| s.id() == format!("{}::AWS.CloudTrail.Meta", ACCOUNT_ID))
        .expect("meta snapshot");
    assert_eq!(meta.attributes["trailCount"], json!(1));
    assert_eq!(meta.attributes["multiRegionLoggingEnabled"], json!(true));
    assert_eq!(meta.attributes["organizationTrailPresent"], json!(true));
}

#[tokio::test]
async fn test_region_scans_kept_per_account() {
    let pipeline = Pipeline::new();
    pipeline.integrations.onboard("222222222222");
    let ours = format!("arn:aws:ec2:{}:{}:instance/i-1", REGION, ACCOUNT_ID);
    let theirs = ours.replace(ACCOUNT_ID, "222222222222");

    let summary = pipeline
        .ingest(&bodies(&[
            tag_event(ACCOUNT_ID, &[ours.as_str()]),
            tag_event("222222222222", &[theirs.as_str()]),
        ]))
        .await
        .expect("ingest");

    // The same fallback scans once per account
    assert_eq!(summary.changes % 2, 0);
    let msg = scan_msg(&pipeline.scan_bodies()[0]);
    for account in [ACCOUNT_ID, "222222222222"] {
        let buckets = msg
            .entries
            .iter()
            .filter(|e| e.aws_account_id == account && e.resource_type == "AWS.S3.Bucket")
            .count();
        assert_eq!(buckets, 1, "account {}", account);
    }
}

#[tokio::test]
async fn test_unreadable_scan_message_is_dropped() {
    let pipeline = Pipeline::new();

    let summary = pipeline
        .poller
        .handle_batch(&["{\"lookupKey\": \"does-not-exist\"}".to_string(), "junk".to_string()])
        .await
        .expect("poll");

    assert_eq!(summary.messages, 0);
    assert!(pipeline.inventory.added().is_empty());
}
