//! Metering: tiers, credit accounts and AI runtime selection.
//!
//! ## Design
//! - Monetization settings live in the metering store, merged over config defaults
//! - Credit balances refill daily and are charged under a per-user lock
//! - `byok` users are never metered and always run on their own settings
//! - API keys are stored as encrypted envelopes, shown only masked

pub mod config;
pub mod ledger;
pub mod runtime;
pub mod settings;
pub mod types;

pub use config::{
    MonetizationConfig, MonetizationDefaults, MonetizationStore, MonetizationUpdate,
    MonetizationView, SharedCredentialUpdate,
};
pub use ledger::{ChargeOutcome, CreditLedger, CreditStatus};
pub use runtime::{RuntimeDecision, RuntimeResolver, RuntimeSource};
pub use settings::{UserAiSettings, UserAiSettingsUpdate, UserAiSettingsView, UserSettingsStore};
pub use types::{AiTarget, TaskCostTable, Tier, TierRule, TierRules};

use crate::error::MeteringError;
use crate::store::MeteringStore;

/// Tier of `user`; missing users and unknown tier strings are `byok`.
pub(crate) fn lookup_tier(store: &dyn MeteringStore, user: &str) -> Result<Tier, MeteringError> {
    Ok(Tier::from_stored(store.user_tier(user)?.as_deref()))
}
