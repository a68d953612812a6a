use std::path::Path;

use anyhow::{anyhow, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use storage_driver::StorageConfig;

/// Prefix of environment variables overriding the config file, e.g.
/// `STORAGE_BACKEND=s3` or `STORAGE_S3__BUCKET=media`.
const ENV_PREFIX: &str = "STORAGE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Emit JSON log lines instead of compact text.
    #[serde(default)]
    pub structured_logging: bool,

    #[serde(flatten)]
    pub storage: StorageConfig,
}

impl ToolConfig {
    /// Loads defaults, then the YAML file at `path` if given, then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<ToolConfig> {
        let mut figment = Figment::new().merge(Serialized::defaults(ToolConfig::default()));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        let config: ToolConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "local" => {
                if self.storage.local_base_path.is_empty() {
                    return Err(anyhow!("local_base_path must be set for the local backend"));
                }
            }
            "s3" => {
                let s3 = self
                    .storage
                    .s3
                    .as_ref()
                    .ok_or_else(|| anyhow!("an s3 section is required for the s3 backend"))?;
                if s3.endpoint.is_empty() || s3.bucket.is_empty() {
                    return Err(anyhow!("s3 endpoint and bucket must both be set"));
                }
            }
            other => return Err(anyhow!("invalid storage backend: {other}")),
        }
        Ok(())
    }
}
