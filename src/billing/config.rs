//! Monetization settings: tier rules, task costs and the shared AI credential.
//!
//! Persisted as four system settings. Reads are tolerant: unparseable JSON
//! falls back to the configured defaults and every number is clamped.
//! Writes merge over the current values, and a blank incoming API key never
//! erases a stored one unless the caller asks for replacement.

use super::types::{AiTarget, TaskCostTable, Tier, TierRules, KNOWN_TASKS};
use crate::config::{MonetizationDefaultsConfig, RuntimeConfig};
use crate::error::MeteringError;
use crate::security::SecretVault;
use crate::store::MeteringStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const KEY_ENABLED: &str = "monetization_enabled";
const KEY_TIERS: &str = "monetization_tiers";
const KEY_TASK_COSTS: &str = "monetization_task_costs";
const KEY_SHARED: &str = "monetization_shared";

/// The operator's shared AI credential. `encrypted_api_key` is the stored
/// envelope, or legacy plaintext written before encryption existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCredential {
    pub target: AiTarget,
    pub model: String,
    pub base_url: String,
    pub encrypted_api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonetizationConfig {
    pub enabled: bool,
    pub tiers: TierRules,
    pub task_costs: TaskCostTable,
    pub shared: SharedCredential,
}

/// Shared credential as shown to an admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedCredentialView {
    pub target: AiTarget,
    pub model: String,
    pub base_url: String,
    pub has_api_key: bool,
    pub api_key_masked: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonetizationView {
    pub enabled: bool,
    pub tiers: TierRules,
    pub task_costs: TaskCostTable,
    pub shared: SharedCredentialView,
}

/// Partial update from an admin. Absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonetizationUpdate {
    pub enabled: Option<bool>,
    pub tiers: Option<Value>,
    pub task_costs: Option<Value>,
    pub shared: Option<SharedCredentialUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedCredentialUpdate {
    pub target: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Plaintext. Blank keeps the stored key unless replacement is requested.
    pub api_key: Option<String>,
}

/// Reference data for admin UIs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonetizationDefaults {
    pub tiers: TierRules,
    pub task_costs: TaskCostTable,
    pub known_tasks: Vec<&'static str>,
    pub allowed_tiers: Vec<Tier>,
    pub allowed_targets: Vec<AiTarget>,
}

pub struct MonetizationStore {
    store: Arc<dyn MeteringStore>,
    vault: Arc<SecretVault>,
    defaults: MonetizationDefaultsConfig,
    runtime: RuntimeConfig,
}

impl MonetizationStore {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        vault: Arc<SecretVault>,
        defaults: MonetizationDefaultsConfig,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            vault,
            defaults,
            runtime,
        }
    }

    pub fn defaults(&self) -> MonetizationDefaults {
        MonetizationDefaults {
            tiers: self.defaults.tiers,
            task_costs: self.defaults.task_costs.clone(),
            known_tasks: KNOWN_TASKS.to_vec(),
            allowed_tiers: Tier::ALL.to_vec(),
            allowed_targets: AiTarget::SHARED_ALLOWED.to_vec(),
        }
    }

    /// Current normalised configuration.
    pub fn load(&self) -> Result<MonetizationConfig, MeteringError> {
        let enabled = self
            .store
            .system_setting(KEY_ENABLED)?
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        let tiers = TierRules::normalize(&self.json_setting(KEY_TIERS)?, &self.defaults.tiers);
        let task_costs =
            TaskCostTable::normalize(&self.json_setting(KEY_TASK_COSTS)?, &self.defaults.task_costs);

        let stored = self.json_setting(KEY_SHARED)?;
        let text = |name: &str| stored.get(name).and_then(Value::as_str).map(str::to_string);
        let target = text("target")
            .and_then(|t| t.parse::<AiTarget>().ok())
            .filter(|t| t.allowed_for_shared())
            .unwrap_or(AiTarget::Gemini);
        let shared = SharedCredential {
            target,
            model: text("model").unwrap_or_else(|| self.runtime.model.clone()),
            base_url: text("baseUrl").unwrap_or_else(|| self.runtime.base_url.clone()),
            encrypted_api_key: text("apiKey").unwrap_or_default(),
        };

        Ok(MonetizationConfig {
            enabled,
            tiers,
            task_costs,
            shared,
        })
    }

    /// Admin view of the current configuration.
    pub fn view(&self) -> Result<MonetizationView, MeteringError> {
        Ok(self.view_of(&self.load()?))
    }

    /// Merge `update` over the current configuration and persist it.
    ///
    /// Switching monetization from on to off points every user that relied
    /// on the shared credential back at `gemini`.
    pub fn save(
        &self,
        update: &MonetizationUpdate,
        keep_existing_shared_key: bool,
    ) -> Result<MonetizationView, MeteringError> {
        let current = self.load()?;

        let enabled = update.enabled.unwrap_or(current.enabled);
        let tiers = update
            .tiers
            .as_ref()
            .map_or(current.tiers, |raw| TierRules::normalize(raw, &current.tiers));
        let task_costs = update.task_costs.as_ref().map_or_else(
            || current.task_costs.clone(),
            |raw| TaskCostTable::normalize(raw, &current.task_costs),
        );

        let incoming = update.shared.clone().unwrap_or_default();
        let target = incoming
            .target
            .as_deref()
            .and_then(|t| t.parse::<AiTarget>().ok())
            .filter(|t| t.allowed_for_shared())
            .unwrap_or(current.shared.target);

        let mut api_key = self.vault.decrypt(&current.shared.encrypted_api_key);
        if let Some(key) = incoming.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                api_key = key.to_string();
            } else if !keep_existing_shared_key {
                api_key.clear();
            }
        }
        let encrypted_api_key = if api_key.is_empty() {
            String::new()
        } else {
            self.vault.encrypt(&api_key)?
        };

        let shared = SharedCredential {
            target,
            model: incoming.model.unwrap_or(current.shared.model),
            base_url: incoming.base_url.unwrap_or(current.shared.base_url),
            encrypted_api_key,
        };

        self.store
            .put_system_setting(KEY_ENABLED, if enabled { "true" } else { "false" })?;
        self.store
            .put_system_setting(KEY_TIERS, &serde_json::to_string(&tiers).map_err(anyhow::Error::from)?)?;
        self.store.put_system_setting(
            KEY_TASK_COSTS,
            &serde_json::to_string(&task_costs).map_err(anyhow::Error::from)?,
        )?;
        let shared_json = json!({
            "target": shared.target,
            "model": shared.model,
            "baseUrl": shared.base_url,
            "apiKey": shared.encrypted_api_key,
        });
        self.store.put_system_setting(KEY_SHARED, &shared_json.to_string())?;

        if current.enabled && !enabled {
            let moved = self.store.retarget_ai_settings(
                None,
                AiTarget::Shared.as_str(),
                AiTarget::Gemini.as_str(),
            )?;
            tracing::info!(users = moved, "Monetization disabled; shared AI targets reset to gemini");
        }

        tracing::info!(enabled, shared_target = %shared.target, "Monetization config saved");
        Ok(self.view_of(&MonetizationConfig {
            enabled,
            tiers,
            task_costs,
            shared,
        }))
    }

    fn view_of(&self, config: &MonetizationConfig) -> MonetizationView {
        let masked = self.vault.mask(&config.shared.encrypted_api_key);
        MonetizationView {
            enabled: config.enabled,
            tiers: config.tiers,
            task_costs: config.task_costs.clone(),
            shared: SharedCredentialView {
                target: config.shared.target,
                model: config.shared.model.clone(),
                base_url: config.shared.base_url.clone(),
                has_api_key: !masked.is_empty(),
                api_key_masked: masked,
            },
        }
    }

    /// Stored JSON setting, or `Null` when absent or unparseable.
    fn json_setting(&self, key: &str) -> Result<Value, MeteringError> {
        let Some(raw) = self.store.system_setting(key)? else {
            return Ok(Value::Null);
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(key, "Ignoring unparseable setting: {e}");
            Value::Null
        }))
    }
}
