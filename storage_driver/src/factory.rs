//! Driver construction from configuration.

use tracing::info;

use crate::{
    backend::{Backend, DiskStorage, S3Storage},
    cache::{PresignedUrlCache, SWEEP_PERIOD},
    config::{S3Config, StorageConfig},
    driver::Driver,
    Error,
    Result,
};

impl Driver {
    /// Builds the driver selected by `config.backend`.
    ///
    /// Backend names are matched exactly; anything other than `local` or
    /// `s3` fails with [`Error::InvalidBackend`].
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend.as_str() {
            "local" => Self::new_file_storage(&config.local_base_path),
            "s3" => {
                let s3 = config.s3.as_ref().ok_or_else(|| {
                    Error::Config("backend is s3 but no s3 section is configured".to_string())
                })?;
                Self::new_s3_storage(s3).await
            }
            other => Err(Error::InvalidBackend(other.to_string())),
        }
    }

    /// Opens a disk-backed driver rooted at `base_path`.
    pub fn new_file_storage(base_path: &str) -> Result<Self> {
        if base_path.is_empty() {
            return Err(Error::Config("local base path is empty".to_string()));
        }
        let disk = DiskStorage::open(base_path)?;
        Ok(Self::new(Backend::Disk(disk), false, None))
    }

    /// Connects an S3-backed driver and starts its presigned URL cache.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new_s3_storage(config: &S3Config) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(Error::Config("s3 endpoint is empty".to_string()));
        }
        if config.bucket.is_empty() {
            return Err(Error::Config("s3 bucket is empty".to_string()));
        }

        let s3 = S3Storage::open(config).await?;

        let cache = PresignedUrlCache::with_defaults();
        cache.start(SWEEP_PERIOD);
        info!(proxy = config.proxy, "s3 storage driver ready");

        Ok(Self::new(Backend::S3(s3), config.proxy, Some(cache)))
    }
}
