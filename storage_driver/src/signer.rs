//! Presigned GET URL generation for S3 objects.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{presigning::PresigningConfig, Client as S3Client};
use url::Url;

/// Signs time-limited GET URLs for objects in a bucket.
#[async_trait]
pub trait UrlSigner: Send + Sync {
    /// Returns a URL granting read access to `key` for `ttl`.
    ///
    /// `response_content_type` is echoed back by S3 as the `Content-Type` of
    /// the download.
    async fn presigned_get_object(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_content_type: Option<&str>,
    ) -> Result<Url>;
}

/// [`UrlSigner`] backed by the AWS SDK presigner.
pub struct AwsSigner {
    client: S3Client,
}

impl AwsSigner {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UrlSigner for AwsSigner {
    async fn presigned_get_object(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_content_type: Option<&str>,
    ) -> Result<Url> {
        let presigning = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .context("Failed to build presigning config")?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_response_content_type(response_content_type.map(str::to_string))
            .presigned(presigning)
            .await
            .context("Failed to presign GET URL")?;
        Url::parse(request.uri()).context("Presigner returned an invalid URL")
    }
}

/// Content type hint for `key`, looked up from its file extension.
pub(crate) fn content_type_for_key(key: &str) -> Option<String> {
    mime_guess::from_path(key)
        .first_raw()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for_key() {
        assert_eq!(
            content_type_for_key("attachments/original/01H.jpeg").as_deref(),
            Some("image/jpeg")
        );
        assert_eq!(content_type_for_key("a/b.png").as_deref(), Some("image/png"));
        assert_eq!(content_type_for_key("no-extension"), None);
    }
}
