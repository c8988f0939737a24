//! Per-user AI settings: target, model, base URL and an encrypted API key.

use super::types::AiTarget;
use crate::error::MeteringError;
use crate::security::{mask_plain, SecretVault};
use crate::store::{AiSettingsRow, MeteringStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Settings with the API key decrypted. Never serialised to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAiSettings {
    pub target: AiTarget,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

impl Default for UserAiSettings {
    fn default() -> Self {
        Self {
            target: AiTarget::Gemini,
            model: String::new(),
            base_url: String::new(),
            api_key: String::new(),
        }
    }
}

/// Settings as shown to the user: the key is masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAiSettingsView {
    pub target: AiTarget,
    pub model: String,
    pub base_url: String,
    pub has_api_key: bool,
    pub api_key_masked: String,
}

impl UserAiSettingsView {
    fn of(settings: &UserAiSettings) -> Self {
        Self {
            target: settings.target,
            model: settings.model.clone(),
            base_url: settings.base_url.clone(),
            has_api_key: !settings.api_key.is_empty(),
            api_key_masked: mask_plain(&settings.api_key),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserAiSettingsUpdate {
    pub target: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Plaintext. Blank keeps the stored key unless replacement is requested.
    pub api_key: Option<String>,
}

pub struct UserSettingsStore {
    store: Arc<dyn MeteringStore>,
    vault: Arc<SecretVault>,
}

impl UserSettingsStore {
    pub fn new(store: Arc<dyn MeteringStore>, vault: Arc<SecretVault>) -> Self {
        Self { store, vault }
    }

    pub fn get(&self, user: &str) -> Result<UserAiSettingsView, MeteringError> {
        Ok(UserAiSettingsView::of(&self.get_secret(user)?))
    }

    /// Settings with the decrypted key, for building outgoing AI requests.
    pub fn get_secret(&self, user: &str) -> Result<UserAiSettings, MeteringError> {
        let Some(row) = self.store.ai_settings_row(user)? else {
            return Ok(UserAiSettings::default());
        };
        Ok(UserAiSettings {
            target: row.target.parse().unwrap_or(AiTarget::Gemini),
            model: row.model,
            base_url: row.base_url,
            api_key: self.vault.decrypt(&row.api_key),
        })
    }

    /// Merge `update` over the stored settings.
    pub fn save(
        &self,
        user: &str,
        update: &UserAiSettingsUpdate,
        keep_existing_key: bool,
    ) -> Result<UserAiSettingsView, MeteringError> {
        let current = self.get_secret(user)?;

        let target = match update.target.as_deref() {
            Some(raw) => match raw.parse::<AiTarget>()? {
                t if t.allowed_for_shared() => t,
                _ => return Err(MeteringError::invalid("Invalid AI target")),
            },
            None => current.target,
        };

        let mut api_key = current.api_key;
        if let Some(key) = update.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                api_key = key.to_string();
            } else if !keep_existing_key {
                api_key.clear();
            }
        }
        let encrypted = if api_key.is_empty() {
            String::new()
        } else {
            self.vault.encrypt(&api_key)?
        };

        let merged = UserAiSettings {
            target,
            model: update.model.clone().unwrap_or(current.model),
            base_url: update.base_url.clone().unwrap_or(current.base_url),
            api_key,
        };
        self.store.upsert_ai_settings_row(
            user,
            &AiSettingsRow {
                target: merged.target.as_str().to_string(),
                api_key: encrypted,
                model: merged.model.clone(),
                base_url: merged.base_url.clone(),
            },
        )?;

        tracing::debug!(user, target = %merged.target, "User AI settings saved");
        Ok(UserAiSettingsView::of(&merged))
    }
}
