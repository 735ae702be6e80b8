//! S3-backed [`ObjectStore`] rooted at `fuku/` in the configured bucket

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use fuku_core::{ObjectStore, ObjectStoreError, OBJECT_PREFIX};
use tracing::{debug, info};

use super::errors::ErrorCode;

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(key: &str) -> String {
        format!("{}{}", OBJECT_PREFIX, key)
    }
}

/// Sort an S3 failure into the object store's error classes.
fn classify<E: ErrorCode + std::fmt::Display>(key: &str, err: E) -> ObjectStoreError {
    match err.error_code() {
        Some("AccessDenied") | Some("Forbidden") => ObjectStoreError::AccessDenied {
            key: key.to_string(),
        },
        _ => ObjectStoreError::Unavailable {
            key: key.to_string(),
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let full = Self::object_key(key);
        debug!(bucket = %self.bucket, key = %full, "s3 get");
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(classify(key, err));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| ObjectStoreError::Unavailable {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        let full = Self::object_key(key);
        debug!(bucket = %self.bucket, key = %full, bytes = body.len(), "s3 put");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| classify(key, err))?;
        Ok(())
    }

}

/// Create `bucket` unless it is already reachable.
pub async fn ensure_bucket(client: &Client, bucket: &str, region: &str) -> anyhow::Result<()> {
    if client.head_bucket().bucket(bucket).send().await.is_ok() {
        debug!(bucket, "bucket exists");
        return Ok(());
    }

    let mut request = client.create_bucket().bucket(bucket);
    // us-east-1 rejects an explicit location constraint
    if region != "us-east-1" {
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        );
    }
    let created = super::tolerate_existing(request.send().await)
        .map_err(|err| anyhow::anyhow!("Failed to create bucket {}: {}", bucket, err))?;
    if created.is_some() {
        info!(bucket, region, "created bucket");
    }
    Ok(())
}
