//! Durable rows behind the metering layer.
//!
//! [`MeteringStore`] is the persisted-row contract the credit ledger, the
//! monetization config and the user AI settings are written against.
//! [`SqliteStore`] is the bundled implementation.

pub mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;

/// A user's credit account as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRow {
    pub balance: i64,
    /// UTC calendar day, `YYYY-MM-DD`.
    pub last_refill_day: String,
}

/// A user's AI settings as stored. `api_key` holds the encrypted envelope
/// (or legacy plaintext), never a freshly supplied key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AiSettingsRow {
    pub target: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Persisted-row contract. Implementations must be safe to share across tasks.
pub trait MeteringStore: Send + Sync {
    /// Raw tier string for `email`, `None` when the user row is absent.
    fn user_tier(&self, email: &str) -> Result<Option<String>>;

    /// Create the user or overwrite their tier.
    fn upsert_user(&self, email: &str, tier: &str) -> Result<()>;

    /// Update an existing user's tier. Returns false when no such user.
    fn set_user_tier(&self, email: &str, tier: &str) -> Result<bool>;

    fn credit_row(&self, email: &str) -> Result<Option<CreditRow>>;

    /// Insert a credit row unless one exists. Returns whether a row was inserted.
    fn insert_credit_row_if_absent(&self, email: &str, balance: i64, day: &str) -> Result<bool>;

    /// Overwrite the balance, and the refill day when `day` is given.
    fn update_credit_row(&self, email: &str, balance: i64, day: Option<&str>) -> Result<()>;

    fn ai_settings_row(&self, email: &str) -> Result<Option<AiSettingsRow>>;

    fn upsert_ai_settings_row(&self, email: &str, row: &AiSettingsRow) -> Result<()>;

    /// Change `ai_target` from `from` to `to`, for one user or (when `user`
    /// is `None`) for everyone. Returns the number of rows changed.
    fn retarget_ai_settings(&self, user: Option<&str>, from: &str, to: &str) -> Result<usize>;

    fn system_setting(&self, key: &str) -> Result<Option<String>>;

    fn put_system_setting(&self, key: &str, value: &str) -> Result<()>;
}
