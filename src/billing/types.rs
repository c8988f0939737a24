//! Tiers, AI targets, tier rules and task costs.
//!
//! Every numeric value that arrives from storage or an admin request goes
//! through [`clamp_units`]: out-of-range or non-numeric input is clamped,
//! never rejected.

use crate::error::MeteringError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upper bound for caps, refills and task costs.
pub const MAX_UNITS: u32 = 1_000_000;

/// Task names the UI knows how to meter.
pub const KNOWN_TASKS: [&str; 10] = [
    "continuity",
    "character-profile",
    "plot-suggestion",
    "extract-characters",
    "extract-world",
    "extract-plot",
    "plot-consensus",
    "chat",
    "layout-css",
    "blurb",
];

/// Key of the fallback entry in a [`TaskCostTable`].
pub const DEFAULT_TASK: &str = "default";

const DEFAULT_TASK_COST: u32 = 10;

/// Clamp a loosely-typed JSON number into `[0, MAX_UNITS]`.
///
/// Floats are rounded and numeric strings parsed; anything else counts as 0.
pub fn clamp_units(value: &Value) -> u32 {
    let n = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    };
    if !n.is_finite() {
        return 0;
    }
    n.round().clamp(0.0, f64::from(MAX_UNITS)) as u32
}

// ── Tier ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    /// Bring your own key: never metered.
    Byok,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Byok];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Byok => "byok",
        }
    }

    /// Lenient parse for stored values: unknown or missing means `byok`.
    pub fn from_stored(raw: Option<&str>) -> Self {
        raw.and_then(|r| r.parse().ok()).unwrap_or(Self::Byok)
    }
}

impl FromStr for Tier {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "byok" => Ok(Self::Byok),
            _ => Err(MeteringError::invalid("Invalid tier")),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── AI target ───────────────────────────────────────────────────

/// Which AI backend a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiTarget {
    Gemini,
    OpenaiCompatible,
    Disabled,
    /// Legacy user-settings value; read but never written.
    Shared,
}

impl AiTarget {
    /// Targets that may be written, for the shared credential or a user.
    pub const SHARED_ALLOWED: [AiTarget; 3] =
        [AiTarget::Gemini, AiTarget::OpenaiCompatible, AiTarget::Disabled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenaiCompatible => "openai_compatible",
            Self::Disabled => "disabled",
            Self::Shared => "shared",
        }
    }

    pub fn allowed_for_shared(self) -> bool {
        self != Self::Shared
    }
}

impl FromStr for AiTarget {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "gemini" => Ok(Self::Gemini),
            "openai_compatible" => Ok(Self::OpenaiCompatible),
            "disabled" => Ok(Self::Disabled),
            "shared" => Ok(Self::Shared),
            _ => Err(MeteringError::invalid("Invalid AI target")),
        }
    }
}

impl fmt::Display for AiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tier rules ──────────────────────────────────────────────────

/// Credit cap and daily refill for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRule {
    pub cap: u32,
    pub refill_per_day: u32,
}

impl TierRule {
    /// Overlay a loosely-typed `{cap, refillPerDay}` object on `base`.
    fn overlay(raw: Option<&Value>, base: TierRule) -> Self {
        let field = |name: &str, fallback: u32| {
            raw.and_then(|r| r.get(name))
                .filter(|v| !v.is_null())
                .map_or(fallback, clamp_units)
        };
        Self {
            cap: field("cap", base.cap).min(MAX_UNITS),
            refill_per_day: field("refillPerDay", base.refill_per_day).min(MAX_UNITS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierRules {
    pub free: TierRule,
    pub pro: TierRule,
    pub byok: TierRule,
}

impl Default for TierRules {
    fn default() -> Self {
        Self {
            free: TierRule {
                cap: 100,
                refill_per_day: 20,
            },
            pro: TierRule {
                cap: 2000,
                refill_per_day: 20,
            },
            byok: TierRule {
                cap: 0,
                refill_per_day: 0,
            },
        }
    }
}

impl TierRules {
    pub fn rule(&self, tier: Tier) -> TierRule {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Byok => self.byok,
        }
    }

    /// Normalise raw JSON over `base`: tiers or fields that are missing keep
    /// the base values, present ones are clamped.
    pub fn normalize(raw: &Value, base: &TierRules) -> Self {
        let obj = raw.as_object();
        let tier = |name: &str, fallback: TierRule| {
            TierRule::overlay(obj.and_then(|o| o.get(name)).filter(|v| v.is_object()), fallback)
        };
        Self {
            free: tier("free", base.free),
            pro: tier("pro", base.pro),
            byok: tier("byok", base.byok),
        }
    }

    /// Re-clamp values that came from a typed source such as the config file.
    pub fn clamped(&self) -> Self {
        let clamp = |r: TierRule| TierRule {
            cap: r.cap.min(MAX_UNITS),
            refill_per_day: r.refill_per_day.min(MAX_UNITS),
        };
        Self {
            free: clamp(self.free),
            pro: clamp(self.pro),
            byok: clamp(self.byok),
        }
    }
}

// ── Task costs ──────────────────────────────────────────────────

/// Task name → credit cost, always including a `default` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskCostTable(BTreeMap<String, u32>);

impl Default for TaskCostTable {
    fn default() -> Self {
        let costs = [
            ("continuity", 12),
            ("character-profile", 8),
            ("plot-suggestion", 8),
            ("extract-characters", 10),
            ("extract-world", 10),
            ("extract-plot", 10),
            ("plot-consensus", 24),
            ("chat", 6),
            ("layout-css", 8),
            ("blurb", 8),
            (DEFAULT_TASK, DEFAULT_TASK_COST),
        ];
        Self(
            costs
                .into_iter()
                .map(|(task, cost)| (task.to_string(), cost))
                .collect(),
        )
    }
}

impl TaskCostTable {
    /// Cost of `task`, falling back to the `default` entry.
    pub fn cost_for(&self, task: &str) -> u32 {
        self.get(task.trim())
            .or_else(|| self.get(DEFAULT_TASK))
            .unwrap_or(DEFAULT_TASK_COST)
            .min(MAX_UNITS)
    }

    pub fn get(&self, task: &str) -> Option<u32> {
        self.0.get(task).copied()
    }

    /// Overlay raw JSON entries on `base`, clamping each value.
    pub fn normalize(raw: &Value, base: &TaskCostTable) -> Self {
        let mut next = base.clone();
        if let Some(obj) = raw.as_object() {
            for (task, cost) in obj {
                next.0.insert(task.clone(), clamp_units(cost));
            }
        }
        next.0.entry(DEFAULT_TASK.to_string()).or_insert(DEFAULT_TASK_COST);
        next
    }

    /// Overlay these entries on the built-in defaults, clamping each value.
    pub fn over_defaults(&self) -> Self {
        let mut next = Self::default();
        for (task, cost) in &self.0 {
            next.0.insert(task.clone(), (*cost).min(MAX_UNITS));
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamp_units_handles_loose_json() {
        assert_eq!(clamp_units(&json!(12)), 12);
        assert_eq!(clamp_units(&json!(12.6)), 13);
        assert_eq!(clamp_units(&json!(-5)), 0);
        assert_eq!(clamp_units(&json!(5_000_000)), MAX_UNITS);
        assert_eq!(clamp_units(&json!(" 40 ")), 40);
        assert_eq!(clamp_units(&json!("lots")), 0);
        assert_eq!(clamp_units(&json!(null)), 0);
        assert_eq!(clamp_units(&json!([1])), 0);
    }

    #[test]
    fn stored_tier_is_lenient_admin_tier_is_strict() {
        assert_eq!(Tier::from_stored(Some("PRO")), Tier::Pro);
        assert_eq!(Tier::from_stored(Some("platinum")), Tier::Byok);
        assert_eq!(Tier::from_stored(None), Tier::Byok);
        assert!("platinum".parse::<Tier>().is_err());
        assert_eq!(" Free ".parse::<Tier>().unwrap(), Tier::Free);
    }

    #[test]
    fn ai_target_parsing() {
        assert_eq!("openai_compatible".parse::<AiTarget>().unwrap(), AiTarget::OpenaiCompatible);
        assert!("anthropic".parse::<AiTarget>().is_err());
        assert!(!AiTarget::Shared.allowed_for_shared());
        assert_eq!(
            serde_json::to_value(AiTarget::OpenaiCompatible).unwrap(),
            json!("openai_compatible")
        );
    }

    #[test]
    fn tier_rules_normalize_over_base() {
        let base = TierRules::default();
        let rules = TierRules::normalize(
            &json!({ "free": { "cap": 50 }, "pro": { "cap": -1, "refillPerDay": 9e9 }, "byok": "x" }),
            &base,
        );
        assert_eq!(rules.free, TierRule { cap: 50, refill_per_day: 20 });
        assert_eq!(rules.pro, TierRule { cap: 0, refill_per_day: MAX_UNITS });
        assert_eq!(rules.byok, base.byok);

        assert_eq!(TierRules::normalize(&json!("garbage"), &base), base);
    }

    #[test]
    fn tier_rules_serialize_camel_case() {
        let value = serde_json::to_value(TierRules::default()).unwrap();
        assert_eq!(value["free"]["refillPerDay"], json!(20));
        assert_eq!(value["pro"]["cap"], json!(2000));
    }

    #[test]
    fn task_costs_default_and_lookup() {
        let costs = TaskCostTable::default();
        assert_eq!(costs.cost_for("continuity"), 12);
        assert_eq!(costs.cost_for(" plot-consensus "), 24);
        assert_eq!(costs.cost_for("unheard-of"), 10);
        for task in KNOWN_TASKS {
            assert!(costs.get(task).is_some(), "missing {task}");
        }
    }

    #[test]
    fn task_costs_normalize_merges_and_clamps() {
        let costs = TaskCostTable::normalize(
            &json!({ "chat": 2, "translate": 3_000_000, "default": "7" }),
            &TaskCostTable::default(),
        );
        assert_eq!(costs.cost_for("chat"), 2);
        assert_eq!(costs.cost_for("translate"), MAX_UNITS);
        assert_eq!(costs.cost_for("blurb"), 8);
        assert_eq!(costs.cost_for("unheard-of"), 7);
    }

    #[test]
    fn task_costs_always_have_default() {
        let empty = TaskCostTable(BTreeMap::new());
        let costs = TaskCostTable::normalize(&json!({}), &empty);
        assert_eq!(costs.get(DEFAULT_TASK), Some(DEFAULT_TASK_COST));
    }
}
