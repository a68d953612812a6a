//! S3-compatible bucket backend using object_store for data I/O and
//! aws-sdk-s3 for presigning.

use std::{sync::Arc, time::Duration};

use aws_config::BehaviorVersion;
use aws_sdk_s3::{config::Credentials, Client as S3Client};
use object_store::{aws::AmazonS3Builder, ObjectStore};
use tracing::info;
use url::Url;

use crate::{
    config::S3Config,
    signer::{AwsSigner, UrlSigner},
    Error,
    Result,
};

/// Part size for streamed multipart uploads (5 MiB, the S3 minimum).
pub(super) const PUT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Blob store backed by one S3 bucket.
pub struct S3Storage {
    object_store: Arc<dyn ObjectStore>,
    signer: Arc<dyn UrlSigner>,
    bucket: String,
}

impl S3Storage {
    /// Wraps an already configured object store and signer for `bucket`.
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        signer: Arc<dyn UrlSigner>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            object_store,
            signer,
            bucket: bucket.into(),
        }
    }

    /// Connects to the bucket described by `config`.
    ///
    /// Both clients use path-style addressing so that S3-compatible servers
    /// (MinIO, Garage, ...) behind a single host name work. Empty credentials
    /// fall back to the AWS environment.
    pub async fn open(config: &S3Config) -> Result<Self> {
        let endpoint = config.endpoint_url();

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(endpoint.starts_with("http://"));
        if !config.access_key.is_empty() {
            builder = builder
                .with_access_key_id(&config.access_key)
                .with_secret_access_key(&config.secret_key);
        }
        let object_store = builder.build()?;

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(&endpoint)
            .force_path_style(true);
        if !config.access_key.is_empty() {
            s3_config = s3_config.credentials_provider(Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "storage-config",
            ));
        }
        let client = S3Client::from_conf(s3_config.build());

        info!(
            bucket = %config.bucket,
            endpoint = %endpoint,
            "opened s3 storage"
        );

        Ok(Self::new(
            Arc::new(object_store),
            Arc::new(AwsSigner::new(client)),
            config.bucket.clone(),
        ))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub(super) fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    /// Signs a GET URL for `key` valid for `ttl`.
    pub async fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
        response_content_type: Option<&str>,
    ) -> Result<Url> {
        self.signer
            .presigned_get_object(&self.bucket, key, ttl, response_content_type)
            .await
            .map_err(|source| Error::Signing {
                key: key.to_string(),
                source,
            })
    }
}
