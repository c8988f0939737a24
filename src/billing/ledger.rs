//! Per-user credit ledger with daily refill.
//!
//! Accounts are created lazily at the tier's cap. Each whole UTC day since
//! the last refill adds `refill_per_day` credits up to the cap. Charges run
//! under the `credits:<user>` lock so two concurrent charges cannot both
//! spend the same balance.

use super::config::{MonetizationConfig, MonetizationStore};
use super::lookup_tier;
use super::types::{AiTarget, TaskCostTable, Tier};
use crate::coordination::LockManager;
use crate::error::MeteringError;
use crate::store::MeteringStore;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// TTL of the per-user charge lock.
const CHARGE_LOCK_TTL: Duration = Duration::from_millis(5000);

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Credit state reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditStatus {
    pub tier: Tier,
    pub monetization_enabled: bool,
    /// False when the user is never charged (monetization off or `byok`).
    pub limited: bool,
    pub balance: Option<u32>,
    pub cap: Option<u32>,
    pub refill_per_day: Option<u32>,
    pub task_costs: TaskCostTable,
}

/// Result of a charge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOutcome {
    pub charged: bool,
    pub tier: Tier,
    pub cost: u32,
    pub remaining: Option<u32>,
    pub limited: bool,
}

impl ChargeOutcome {
    fn free(tier: Tier) -> Self {
        Self {
            charged: false,
            tier,
            cost: 0,
            remaining: None,
            limited: false,
        }
    }
}

fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Whole days from `from` (a stored `YYYY-MM-DD`) to `today`. Unparseable
/// or future dates count as zero.
fn days_since(from: &str, today: NaiveDate) -> u32 {
    NaiveDate::parse_from_str(from.trim(), DAY_FORMAT)
        .map(|from| (today - from).num_days())
        .map_or(0, |days| u32::try_from(days.max(0)).unwrap_or(u32::MAX))
}

pub struct CreditLedger {
    store: Arc<dyn MeteringStore>,
    monetization: Arc<MonetizationStore>,
    locks: Arc<LockManager>,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        monetization: Arc<MonetizationStore>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            store,
            monetization,
            locks,
        }
    }

    /// Create the account at the tier's cap if absent; clamp an existing
    /// balance that exceeds the cap.
    pub fn ensure_account(&self, user: &str, tier: Tier) -> Result<(), MeteringError> {
        let cfg = self.monetization.load()?;
        self.ensure_account_with(user, tier, &cfg, Utc::now().date_naive())
    }

    fn ensure_account_with(
        &self,
        user: &str,
        tier: Tier,
        cfg: &MonetizationConfig,
        today: NaiveDate,
    ) -> Result<(), MeteringError> {
        let cap = i64::from(cfg.tiers.rule(tier).cap);
        if self
            .store
            .insert_credit_row_if_absent(user, cap, &format_day(today))?
        {
            tracing::debug!(user, tier = %tier, cap, "Created credit account");
            return Ok(());
        }
        if let Some(row) = self.store.credit_row(user)? {
            if row.balance > cap {
                self.store.update_credit_row(user, cap, None)?;
            }
        }
        Ok(())
    }

    /// Current status, applying any pending daily refill.
    pub fn status(&self, user: &str) -> Result<CreditStatus, MeteringError> {
        let cfg = self.monetization.load()?;
        let tier = lookup_tier(self.store.as_ref(), user)?;
        self.status_with(user, tier, &cfg, Utc::now().date_naive())
    }

    fn status_with(
        &self,
        user: &str,
        tier: Tier,
        cfg: &MonetizationConfig,
        today: NaiveDate,
    ) -> Result<CreditStatus, MeteringError> {
        if !cfg.enabled || tier == Tier::Byok {
            return Ok(CreditStatus {
                tier,
                monetization_enabled: cfg.enabled,
                limited: false,
                balance: None,
                cap: None,
                refill_per_day: None,
                task_costs: cfg.task_costs.clone(),
            });
        }

        let rule = cfg.tiers.rule(tier);
        self.ensure_account_with(user, tier, cfg, today)?;

        let mut balance = 0;
        if let Some(row) = self.store.credit_row(user)? {
            balance = u32::try_from(row.balance.clamp(0, i64::from(rule.cap))).unwrap_or(0);
            let elapsed = days_since(&row.last_refill_day, today);
            if elapsed > 0 && rule.refill_per_day > 0 {
                let refill = u64::from(elapsed) * u64::from(rule.refill_per_day);
                balance = (u64::from(balance) + refill).min(u64::from(rule.cap)) as u32;
                self.store
                    .update_credit_row(user, i64::from(balance), Some(&format_day(today)))?;
                tracing::debug!(user, days = elapsed, balance, "Applied daily refill");
            }
        }

        Ok(CreditStatus {
            tier,
            monetization_enabled: cfg.enabled,
            limited: true,
            balance: Some(balance),
            cap: Some(rule.cap),
            refill_per_day: Some(rule.refill_per_day),
            task_costs: cfg.task_costs.clone(),
        })
    }

    /// Deduct the cost of `task` from `user`'s balance.
    ///
    /// A no-op when monetization is off, the user is `byok`, the task is free
    /// or the shared credential is disabled. Fails with
    /// [`MeteringError::InsufficientCredits`] without touching the balance,
    /// or with [`MeteringError::LockHeld`] when a concurrent charge for the
    /// same user is in flight.
    pub async fn charge_for_task(
        &self,
        user: &str,
        task: &str,
    ) -> Result<ChargeOutcome, MeteringError> {
        let (_, tier, cost) = self.charge_terms(user, task)?;
        if cost == 0 {
            return Ok(ChargeOutcome::free(tier));
        }

        let lock_key = format!("credits:{user}");
        self.locks
            .with_lock(&lock_key, CHARGE_LOCK_TTL, || async {
                // Config or tier may have changed while we waited.
                let (cfg, tier, cost) = self.charge_terms(user, task)?;
                if cost == 0 {
                    return Ok(ChargeOutcome::free(tier));
                }
                let today = Utc::now().date_naive();
                let status = self.status_with(user, tier, &cfg, today)?;
                let remaining = status.balance.unwrap_or(0);
                if remaining < cost {
                    tracing::info!(user, task, cost, remaining, "Charge refused: insufficient credits");
                    return Err(MeteringError::InsufficientCredits {
                        required: cost,
                        remaining,
                    });
                }

                let next = remaining - cost;
                self.store
                    .update_credit_row(user, i64::from(next), Some(&format_day(today)))?;
                tracing::info!(user, task, cost, remaining = next, "Credits charged");
                Ok(ChargeOutcome {
                    charged: true,
                    tier,
                    cost,
                    remaining: Some(next),
                    limited: true,
                })
            })
            .await
    }

    /// Current config, tier and the cost `task` would be charged (0 when unmetered).
    fn charge_terms(
        &self,
        user: &str,
        task: &str,
    ) -> Result<(MonetizationConfig, Tier, u32), MeteringError> {
        let cfg = self.monetization.load()?;
        let tier = lookup_tier(self.store.as_ref(), user)?;
        let metered =
            cfg.enabled && tier != Tier::Byok && cfg.shared.target != AiTarget::Disabled;
        let cost = if metered { cfg.task_costs.cost_for(task) } else { 0 };
        Ok((cfg, tier, cost))
    }

    /// Create `email` with `tier` (or overwrite its tier) and open its account.
    pub fn provision_user(&self, email: &str, tier: &str) -> Result<Tier, MeteringError> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(MeteringError::invalid("Valid email is required"));
        }
        let tier: Tier = tier.parse()?;
        self.store.upsert_user(&email, tier.as_str())?;
        self.ensure_account(&email, tier)?;
        tracing::info!(user = %email, tier = %tier, "User provisioned");
        Ok(tier)
    }

    /// Admin operation: change `target`'s tier.
    pub fn set_user_tier(&self, actor: &str, target: &str, tier: &str) -> Result<(), MeteringError> {
        let actor = actor.trim().to_lowercase();
        let target = target.trim().to_lowercase();
        if !target.contains('@') {
            return Err(MeteringError::invalid("Valid target email is required"));
        }
        let tier: Tier = tier.parse()?;
        if actor == target && tier == Tier::Free {
            return Err(MeteringError::invalid(
                "Admins cannot downgrade themselves to free tier",
            ));
        }
        if !self.store.set_user_tier(&target, tier.as_str())? {
            return Err(MeteringError::invalid("User not found"));
        }

        self.ensure_account(&target, tier)?;
        if tier == Tier::Byok {
            self.store.retarget_ai_settings(
                Some(&target),
                AiTarget::Shared.as_str(),
                AiTarget::Gemini.as_str(),
            )?;
        }
        tracing::info!(actor = %actor, target = %target, tier = %tier, "User tier changed");
        Ok(())
    }
}
