use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::db::key::MAX_KEY_ATTRS;
use crate::error::AggregateError;

/// Configuration for the aggregation service.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    /// Colon-separated names of the attributes to aggregate.
    /// Default: the inclusive-time duration attribute.
    #[serde(default = "default_attributes")]
    pub attributes: String,

    /// Colon-separated names of the attributes forming the aggregation
    /// key. Default: empty, which keys on the snapshot's context nodes.
    #[serde(default)]
    pub key: String,
}

fn default_attributes() -> String {
    "time.inclusive.duration".to_string()
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            attributes: default_attributes(),
            key: String::new(),
        }
    }
}

impl AggregateConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: AggregateConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> crate::error::Result<()> {
        let n_key = self.key_attribute_names().len();
        if n_key > MAX_KEY_ATTRS {
            return Err(AggregateError::Config(format!(
                "at most {MAX_KEY_ATTRS} key attributes are supported, got {n_key}"
            )));
        }

        Ok(())
    }

    /// Names of the attributes whose statistics are accumulated.
    pub fn aggregated_attribute_names(&self) -> Vec<String> {
        split_names(&self.attributes)
    }

    /// Names of the attributes forming the aggregation key.
    pub fn key_attribute_names(&self) -> Vec<String> {
        split_names(&self.key)
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(':')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
