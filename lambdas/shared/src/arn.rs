//! ARN parsing and canonical resource ids

use crate::models::ResourceType;

/// A parsed `arn:partition:service:region:account:resource` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arn<'a> {
    pub partition: &'a str,
    pub service: &'a str,
    pub region: &'a str,
    pub account: &'a str,
    /// Everything after the account; may itself contain `:` or `/`
    pub resource: &'a str,
}

pub fn parse(s: &str) -> Option<Arn<'_>> {
    let mut parts = s.splitn(6, ':');
    if parts.next()? != "arn" {
        return None;
    }
    let arn = Arn {
        partition: parts.next()?,
        service: parts.next()?,
        region: parts.next()?,
        account: parts.next()?,
        resource: parts.next()?,
    };
    if arn.service.is_empty() || arn.resource.is_empty() {
        return None;
    }
    Some(arn)
}

pub fn s3_bucket_arn(bucket: &str) -> String {
    format!("arn:aws:s3:::{}", bucket)
}

pub fn dynamodb_table_arn(region: &str, account: &str, table: &str) -> String {
    format!("arn:aws:dynamodb:{}:{}:table/{}", region, account, table)
}

pub fn cloudtrail_arn(region: &str, account: &str, trail: &str) -> String {
    format!("arn:aws:cloudtrail:{}:{}:trail/{}", region, account, trail)
}

pub fn sqs_queue_arn(region: &str, account: &str, queue: &str) -> String {
    format!("arn:aws:sqs:{}:{}:{}", region, account, queue)
}

pub fn ecs_cluster_arn(region: &str, account: &str, cluster: &str) -> String {
    format!("arn:aws:ecs:{}:{}:cluster/{}", region, account, cluster)
}

/// `https://sqs.us-east-1.amazonaws.com/123456789012/name` to its queue ARN
pub fn sqs_queue_arn_from_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let mut parts = rest.split('/');
    let host = parts.next()?;
    let account = parts.next().filter(|a| !a.is_empty())?;
    let name = parts.next().filter(|n| !n.is_empty())?;
    let region = host.strip_prefix("sqs.")?.split('.').next()?;
    Some(sqs_queue_arn(region, account, name))
}

/// Resource type that ARNs of this service most likely name
pub fn service_resource_type(service: &str) -> Option<ResourceType> {
    match service {
        "s3" => Some(ResourceType::S3Bucket),
        "dynamodb" => Some(ResourceType::DynamoDbTable),
        "cloudtrail" => Some(ResourceType::CloudTrail),
        "sqs" => Some(ResourceType::SqsQueue),
        "ecs" => Some(ResourceType::EcsCluster),
        "kms" => Some(ResourceType::KmsKey),
        "lambda" => Some(ResourceType::LambdaFunction),
        _ => None,
    }
}

/// Canonical inventory id for the resource an ARN names, or the resource that owns it.
///
/// Sub-resource ARNs (an ECS service, a DynamoDB stream) resolve to their parent.
/// `None` when the ARN cannot be pinned to one tracked resource.
pub fn canonical_resource(arn_str: &str) -> Option<(ResourceType, String)> {
    let arn = parse(arn_str)?;
    let resource_type = service_resource_type(arn.service)?;
    let id = match resource_type {
        ResourceType::S3Bucket => {
            let bucket = arn.resource.split('/').next().filter(|b| !b.is_empty())?;
            s3_bucket_arn(bucket)
        }
        ResourceType::DynamoDbTable => {
            let table = arn.resource.strip_prefix("table/")?.split('/').next()?;
            dynamodb_table_arn(arn.region, arn.account, table)
        }
        ResourceType::CloudTrail => {
            let trail = arn.resource.strip_prefix("trail/")?;
            cloudtrail_arn(arn.region, arn.account, trail)
        }
        ResourceType::SqsQueue => sqs_queue_arn(arn.region, arn.account, arn.resource),
        ResourceType::EcsCluster => {
            let mut segments = arn.resource.split('/');
            let cluster = match segments.next()? {
                "cluster" => segments.next()?,
                // new-format ids embed the cluster: service/{cluster}/{name}
                "service" | "task" | "container-instance" => {
                    let cluster = segments.next()?;
                    segments.next()?;
                    cluster
                }
                _ => return None,
            };
            ecs_cluster_arn(arn.region, arn.account, cluster)
        }
        ResourceType::KmsKey => {
            arn.resource.strip_prefix("key/")?;
            arn_str.to_string()
        }
        ResourceType::LambdaFunction => {
            let mut segments = arn.resource.split(':');
            if segments.next()? != "function" {
                return None;
            }
            let name = segments.next()?;
            format!("arn:{}:lambda:{}:{}:function:{}", arn.partition, arn.region, arn.account, name)
        }
        ResourceType::CloudTrailMeta => return None,
    };
    Some((resource_type, id))
}
