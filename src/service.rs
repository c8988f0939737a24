//! Service facade: everything request handlers call, wired once from [`Config`].

use crate::billing::{
    ChargeOutcome, CreditLedger, CreditStatus, MonetizationDefaults, MonetizationStore,
    MonetizationUpdate, MonetizationView, RuntimeDecision, RuntimeResolver, Tier,
    UserAiSettingsUpdate, UserAiSettingsView, UserSettingsStore,
};
use crate::config::Config;
use crate::coordination::{self, BackendInfo, CoordinationBackend, CounterService, LockManager};
use crate::error::MeteringError;
use crate::security::SecretVault;
use crate::store::{MeteringStore, SqliteStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct MeteringService {
    backend: Option<Arc<dyn CoordinationBackend>>,
    url_configured: bool,
    locks: Arc<LockManager>,
    counters: CounterService,
    vault: Arc<SecretVault>,
    monetization: Arc<MonetizationStore>,
    ledger: CreditLedger,
    settings: Arc<UserSettingsStore>,
    resolver: RuntimeResolver,
}

impl MeteringService {
    /// Open the SQLite store and the coordination client described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db_path = config.db_path();
        let store: Arc<dyn MeteringStore> = Arc::new(SqliteStore::new(&db_path)?);
        let backend = coordination::create_backend(&config.coordination)?;
        tracing::info!(db = %db_path.display(), coordinated = backend.is_some(), "Metering service ready");
        Ok(Self::with_parts(config, store, backend))
    }

    /// Wire the service from already-built collaborators.
    pub fn with_parts(
        config: &Config,
        store: Arc<dyn MeteringStore>,
        backend: Option<Arc<dyn CoordinationBackend>>,
    ) -> Self {
        let namespace = config.coordination.namespace.as_str();
        let vault = Arc::new(SecretVault::from_material(
            config.secrets.key_material.as_deref().unwrap_or_default(),
        ));
        let locks = Arc::new(LockManager::new(backend.clone(), namespace));
        let counters = CounterService::new(backend.clone(), namespace);
        let monetization = Arc::new(MonetizationStore::new(
            store.clone(),
            vault.clone(),
            config.monetization.clone(),
            config.runtime.clone(),
        ));
        let ledger = CreditLedger::new(store.clone(), monetization.clone(), locks.clone());
        let settings = Arc::new(UserSettingsStore::new(store.clone(), vault.clone()));
        let resolver = RuntimeResolver::new(
            store,
            monetization.clone(),
            settings.clone(),
            vault.clone(),
            config.runtime.clone(),
        );

        let url_configured = config
            .coordination
            .url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());

        Self {
            backend,
            url_configured,
            locks,
            counters,
            vault,
            monetization,
            ledger,
            settings,
            resolver,
        }
    }

    // ── Coordination ────────────────────────────────────────────────

    /// Run `f` under the distributed lock for `key`.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, ttl_ms: u64, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MeteringError>,
    {
        self.locks
            .with_lock(key, Duration::from_millis(ttl_ms), f)
            .await
    }

    pub async fn increment_counter(&self, key: &str, window_secs: u64) -> Result<i64, MeteringError> {
        self.counters.increment(key, window_secs).await
    }

    pub fn backend_info(&self) -> BackendInfo {
        BackendInfo::for_backend(self.backend.as_ref(), self.url_configured)
    }

    // ── Credits ─────────────────────────────────────────────────────

    pub async fn charge_for_task(
        &self,
        user: &str,
        task: &str,
    ) -> Result<ChargeOutcome, MeteringError> {
        self.ledger.charge_for_task(user, task).await
    }

    pub fn credit_status(&self, user: &str) -> Result<CreditStatus, MeteringError> {
        self.ledger.status(user)
    }

    pub fn provision_user(&self, email: &str, tier: &str) -> Result<Tier, MeteringError> {
        self.ledger.provision_user(email, tier)
    }

    pub fn set_user_tier(&self, actor: &str, target: &str, tier: &str) -> Result<(), MeteringError> {
        self.ledger.set_user_tier(actor, target, tier)
    }

    pub fn resolve_runtime(&self, user: &str) -> Result<RuntimeDecision, MeteringError> {
        self.resolver.resolve(user)
    }

    // ── Secrets ─────────────────────────────────────────────────────

    pub fn encrypt_secret(&self, plaintext: &str) -> Result<String, MeteringError> {
        Ok(self.vault.encrypt(plaintext)?)
    }

    pub fn decrypt_secret(&self, value: &str) -> String {
        self.vault.decrypt(value)
    }

    // ── Admin settings ──────────────────────────────────────────────

    pub fn monetization_config(&self) -> Result<MonetizationView, MeteringError> {
        self.monetization.view()
    }

    pub fn save_monetization_config(
        &self,
        update: &MonetizationUpdate,
        keep_existing_shared_key: bool,
    ) -> Result<MonetizationView, MeteringError> {
        self.monetization.save(update, keep_existing_shared_key)
    }

    pub fn monetization_defaults(&self) -> MonetizationDefaults {
        self.monetization.defaults()
    }

    pub fn user_ai_settings(&self, user: &str) -> Result<UserAiSettingsView, MeteringError> {
        self.settings.get(user)
    }

    pub fn save_user_ai_settings(
        &self,
        user: &str,
        update: &UserAiSettingsUpdate,
        keep_existing_key: bool,
    ) -> Result<UserAiSettingsView, MeteringError> {
        self.settings.save(user, update, keep_existing_key)
    }
}
