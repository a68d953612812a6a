//! Blob storage driver supporting local directory and S3 backends.
//!
//! Provides a single [`Driver`] API for reading, writing, listing and
//! deleting blobs by key, independent of where they are stored. On S3 the
//! driver also hands out presigned download URLs, cached per key, and can
//! probe the origin those URLs point at for use in a content-security-policy.
//!
//! ```rust,no_run
//! use storage_driver::{Driver, StorageConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> storage_driver::Result<()> {
//! let driver = Driver::from_config(&StorageConfig::default()).await?;
//! let cancel = CancellationToken::new();
//!
//! driver.put(&cancel, "attachments/1.png", vec![0u8; 16]).await?;
//! match driver.url(&cancel, "attachments/1.png").await {
//!     Some(presigned) => println!("redirect to {}", presigned.url),
//!     None => {
//!         let bytes = driver.get(&cancel, "attachments/1.png").await?;
//!         println!("serve {} bytes", bytes.len());
//!     }
//! }
//! driver.close()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
mod driver;
mod error;
mod factory;
pub mod signer;

#[cfg(test)]
mod testing;

pub use backend::{Backend, DiskStorage, S3Storage, LOCK_KEY};
pub use cache::{
    PresignedUrl,
    PresignedUrlCache,
    CACHE_CAPACITY,
    CACHE_TTL,
    SWEEP_PERIOD,
    URL_VALIDITY,
};
pub use config::{S3Config, StorageConfig};
pub use driver::{Driver, CSP_PROBE_KEY};
pub use error::{Error, Result};
pub use signer::{AwsSigner, UrlSigner};
