//! Configuration schema, deserialised from `config.toml`.

use crate::billing::types::{AiTarget, TaskCostTable, TierRules};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, built once at startup and injected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from. Not serialised.
    #[serde(skip)]
    pub config_path: PathBuf,

    pub coordination: CoordinationConfig,
    pub secrets: SecretsConfig,
    pub monetization: MonetizationDefaultsConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
}

/// `[coordination]`: the RESP backend used for locks and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// `redis://[user:password@]host[:port][/db]` or `rediss://...` for TLS.
    /// Unset means process-local locks and counters.
    pub url: Option<String>,
    /// Prefix for every key this service writes.
    pub namespace: String,
    /// Deadline for one command, covering connect, write and read.
    pub timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: "quillgate:".into(),
            timeout_ms: 2000,
        }
    }
}

/// `[secrets]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// At least 32 characters; shorter material falls back to a development key.
    pub key_material: Option<String>,
}

/// `[monetization]`: defaults used until an admin saves their own values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonetizationDefaultsConfig {
    pub tiers: TierRules,
    pub task_costs: TaskCostTable,
}

/// `[runtime]`: AI settings used when neither the user nor the shared
/// credential provides a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub target: AiTarget,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            target: AiTarget::Gemini,
            model: "gemini-2.5-flash".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `metering.db` next to the config file.
    pub db_path: Option<PathBuf>,
}
