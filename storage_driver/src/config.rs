//! Storage configuration.

use std::env;

use serde::{Deserialize, Serialize};

/// Configuration for the storage driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend name: `local` or `s3`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Base directory of the `local` backend.
    #[serde(default = "default_local_base_path")]
    pub local_base_path: String,

    /// Settings of the `s3` backend.
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local_base_path: default_local_base_path(),
            s3: None,
        }
    }
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Endpoint host, optionally with a port (e.g. `minio:9000`).
    pub endpoint: String,

    pub access_key: String,

    pub secret_key: String,

    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,

    /// Serve object bytes through the application instead of handing out
    /// presigned links.
    #[serde(default)]
    pub proxy: bool,
}

impl S3Config {
    /// Endpoint as an absolute URL, honouring `use_ssl`.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            return self.endpoint.clone();
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_use_ssl() -> bool {
    true
}

/// Default local storage directory, relative to the working directory.
pub fn default_local_base_path() -> String {
    env::current_dir()
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
        .join("storage")
        .to_str()
        .unwrap_or("./storage")
        .to_string()
}
