//! AWS S3 object writer.
//!
//! Batches land at `s3://{bucket}/{root}/{date}/{name}`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{AppError, Result};
use crate::storage::{ObjectKey, ObjectWriter};

/// S3-backed batch object writer.
pub struct S3ObjectWriter {
    client: Client,
    bucket: String,
    root: String,
}

impl S3ObjectWriter {
    /// Create a new S3 writer.
    pub fn new(client: Client, bucket: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            root: root.into(),
        }
    }

    /// Create an S3 writer with credentials and region from the AWS environment.
    pub async fn from_env(bucket: impl Into<String>, root: impl Into<String>) -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);

        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(AppError::config("S3 bucket name is empty"));
        }

        Ok(Self::new(client, bucket, root))
    }
}

#[async_trait]
impl ObjectWriter for S3ObjectWriter {
    async fn upload(&self, key: &ObjectKey, payload: Vec<u8>) -> Result<String> {
        let object_key = key.path(&self.root);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(payload))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| AppError::upload(&object_key, AppError::S3(e.to_string())))?;

        Ok(format!("s3://{}/{}", self.bucket, object_key))
    }
}
