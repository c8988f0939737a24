//! Decides whose AI credentials serve a request.
//!
//! - **User**: monetization off, or the user is `byok`. The user's own
//!   settings apply; blank fields fall back to the runtime defaults.
//! - **Shared**: everyone else runs on the operator's shared credential and
//!   is metered through the credit ledger.

use super::config::MonetizationStore;
use super::lookup_tier;
use super::settings::UserSettingsStore;
use super::types::{AiTarget, Tier};
use crate::config::RuntimeConfig;
use crate::error::MeteringError;
use crate::security::SecretVault;
use crate::store::MeteringStore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSource {
    User,
    Shared,
}

impl fmt::Display for RuntimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Shared => "shared",
        })
    }
}

/// Resolved AI runtime for one request.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDecision {
    pub target: AiTarget,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub source: RuntimeSource,
    pub tier: Tier,
}

// Keep keys out of logs.
impl fmt::Debug for RuntimeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeDecision")
            .field("target", &self.target)
            .field("api_key", &crate::security::mask_plain(&self.api_key))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("source", &self.source)
            .field("tier", &self.tier)
            .finish()
    }
}

fn or_default(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

pub struct RuntimeResolver {
    store: Arc<dyn MeteringStore>,
    monetization: Arc<MonetizationStore>,
    settings: Arc<UserSettingsStore>,
    vault: Arc<SecretVault>,
    defaults: RuntimeConfig,
}

impl RuntimeResolver {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        monetization: Arc<MonetizationStore>,
        settings: Arc<UserSettingsStore>,
        vault: Arc<SecretVault>,
        defaults: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            monetization,
            settings,
            vault,
            defaults,
        }
    }

    pub fn resolve(&self, user: &str) -> Result<RuntimeDecision, MeteringError> {
        let tier = lookup_tier(self.store.as_ref(), user)?;
        let cfg = self.monetization.load()?;

        if !cfg.enabled || tier == Tier::Byok {
            let own = self.settings.get_secret(user)?;
            // `shared` means nothing without monetization; use the default target.
            let target = match own.target {
                AiTarget::Shared => self.defaults.target,
                other => other,
            };
            return Ok(RuntimeDecision {
                target,
                api_key: or_default(own.api_key, &self.defaults.api_key),
                model: or_default(own.model, &self.defaults.model),
                base_url: or_default(own.base_url, &self.defaults.base_url),
                source: RuntimeSource::User,
                tier,
            });
        }

        Ok(RuntimeDecision {
            target: cfg.shared.target,
            api_key: self.vault.decrypt(&cfg.shared.encrypted_api_key),
            model: or_default(cfg.shared.model, &self.defaults.model),
            base_url: or_default(cfg.shared.base_url, &self.defaults.base_url),
            source: RuntimeSource::Shared,
            tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::config::{MonetizationUpdate, SharedCredentialUpdate};
    use crate::billing::settings::UserAiSettingsUpdate;
    use crate::config::MonetizationDefaultsConfig;
    use crate::store::{AiSettingsRow, SqliteStore};

    struct Fixture {
        store: Arc<SqliteStore>,
        monetization: Arc<MonetizationStore>,
        settings: Arc<UserSettingsStore>,
        resolver: RuntimeResolver,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let vault = Arc::new(SecretVault::from_material("resolver-tests-key-material-0123456789"));
        let defaults = RuntimeConfig {
            api_key: "env-default-key".into(),
            ..RuntimeConfig::default()
        };
        let monetization = Arc::new(MonetizationStore::new(
            store.clone(),
            vault.clone(),
            MonetizationDefaultsConfig::default(),
            defaults.clone(),
        ));
        let settings = Arc::new(UserSettingsStore::new(store.clone(), vault.clone()));
        let resolver = RuntimeResolver::new(
            store.clone(),
            monetization.clone(),
            settings.clone(),
            vault,
            defaults,
        );
        Fixture {
            store,
            monetization,
            settings,
            resolver,
        }
    }

    fn enable_with_shared_key(f: &Fixture) {
        f.monetization
            .save(
                &MonetizationUpdate {
                    enabled: Some(true),
                    shared: Some(SharedCredentialUpdate {
                        target: Some("openai_compatible".into()),
                        model: Some("".into()),
                        api_key: Some("sk-operator".into()),
                        ..SharedCredentialUpdate::default()
                    }),
                    ..MonetizationUpdate::default()
                },
                true,
            )
            .unwrap();
    }

    #[test]
    fn disabled_monetization_uses_user_settings_with_defaults() {
        let f = fixture();
        f.store.upsert_user("a@b.c", "free").unwrap();
        f.settings
            .save(
                "a@b.c",
                &UserAiSettingsUpdate {
                    model: Some("gemini-2.5-pro".into()),
                    ..UserAiSettingsUpdate::default()
                },
                true,
            )
            .unwrap();

        let decision = f.resolver.resolve("a@b.c").unwrap();
        assert_eq!(decision.source, RuntimeSource::User);
        assert_eq!(decision.tier, Tier::Free);
        assert_eq!(decision.model, "gemini-2.5-pro");
        assert_eq!(decision.api_key, "env-default-key");
        assert_eq!(decision.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn byok_always_resolves_to_user() {
        let f = fixture();
        enable_with_shared_key(&f);
        f.store.upsert_user("own@key.io", "byok").unwrap();
        f.settings
            .save(
                "own@key.io",
                &UserAiSettingsUpdate {
                    target: Some("openai_compatible".into()),
                    api_key: Some("sk-mine".into()),
                    ..UserAiSettingsUpdate::default()
                },
                true,
            )
            .unwrap();

        let decision = f.resolver.resolve("own@key.io").unwrap();
        assert_eq!(decision.source, RuntimeSource::User);
        assert_eq!(decision.target, AiTarget::OpenaiCompatible);
        assert_eq!(decision.api_key, "sk-mine");
    }

    #[test]
    fn metered_tiers_use_shared_credential() {
        let f = fixture();
        enable_with_shared_key(&f);
        f.store.upsert_user("a@b.c", "pro").unwrap();

        let decision = f.resolver.resolve("a@b.c").unwrap();
        assert_eq!(decision.source, RuntimeSource::Shared);
        assert_eq!(decision.target, AiTarget::OpenaiCompatible);
        assert_eq!(decision.api_key, "sk-operator");
        assert_eq!(decision.model, "gemini-2.5-flash");
    }

    #[test]
    fn legacy_shared_target_maps_to_default_when_unmetered() {
        let f = fixture();
        f.store
            .upsert_ai_settings_row(
                "own@key.io",
                &AiSettingsRow {
                    target: "shared".into(),
                    ..AiSettingsRow::default()
                },
            )
            .unwrap();
        let decision = f.resolver.resolve("own@key.io").unwrap();
        assert_eq!(decision.target, AiTarget::Gemini);
    }

    #[test]
    fn debug_output_masks_key() {
        let f = fixture();
        enable_with_shared_key(&f);
        f.store.upsert_user("a@b.c", "free").unwrap();
        let rendered = format!("{:?}", f.resolver.resolve("a@b.c").unwrap());
        assert!(!rendered.contains("sk-operator"));
    }
}
