use a2b_core::{NodeSignature, MASTER_NODE};
use serde::Deserialize;
use thiserror::Error;

use crate::commands::BODY_UNION_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Number of slave slots; the plugin table holds one more for the Master.
    pub max_slaves: u8,
    /// Executor passes run once every `tick_multiple` stack ticks.
    pub tick_multiple: u32,
    /// Minimum message payload size in bytes.
    pub min_payload_size: usize,
    /// Stack heap byte budget; `None` accounts without a limit.
    pub heap_limit: Option<usize>,
    /// Signature offered to plugins during lazy Master discovery.
    pub master: NodeSignature,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_slaves: 16,
            tick_multiple: 1,
            min_payload_size: 32,
            heap_limit: None,
            master: NodeSignature::default(),
        }
    }
}

impl StackConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_slaves == 0 {
            return Err(ConfigError::Invalid("max_slaves must be at least 1"));
        }
        if self.tick_multiple == 0 {
            return Err(ConfigError::Invalid("tick_multiple must be at least 1"));
        }
        if self.master.node_addr != MASTER_NODE {
            return Err(ConfigError::Invalid("master signature must use the master address"));
        }
        Ok(())
    }

    /// Inline payload capacity of every message.
    pub fn payload_capacity(&self) -> usize {
        self.min_payload_size.max(BODY_UNION_SIZE)
    }
}
