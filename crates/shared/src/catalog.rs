//! Per-app catalog: plans, addons, gateway product maps, price books and
//! rules, and the per-team wallet configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AddonId, AppId, PlanId, PriceBookId, PriceRuleId, ProductMapId, TeamId};

// ── Plans & addons ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    pub app_id: AppId,
    pub code: String,
    pub name: String,
    /// Feature flags granted by the plan, overlaid last during entitlement
    /// resolution.
    pub feature_flags: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub id: AddonId,
    pub app_id: AppId,
    pub code: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ── Gateway product map ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductMapKind {
    Base,
    Seat,
    Addon,
}

/// Binds a plan or addon to gateway product + price identifiers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeProductMap {
    pub id: ProductMapId,
    pub app_id: AppId,
    pub plan_id: Option<PlanId>,
    pub addon_id: Option<AddonId>,
    pub kind: ProductMapKind,
    pub stripe_product_id: String,
    pub stripe_price_id: String,
}

// ── Price books ───────────────────────────────────────────────────────────────

/// The two parallel pricing streams: operator cost and customer charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceBookKind {
    Cogs,
    Customer,
}

impl PriceBookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceBookKind::Cogs => "COGS",
            PriceBookKind::Customer => "CUSTOMER",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBook {
    pub id: PriceBookId,
    pub app_id: AppId,
    pub kind: PriceBookKind,
    pub currency: String,
    pub effective_from: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A single pricing rule. `match_spec` is a conjunction of equality checks on
/// `eventType` and scalar payload fields; `rule_spec` is the amount formula.
/// Both are opaque JSON here and decoded strictly by the pricing engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRule {
    pub id: PriceRuleId,
    pub price_book_id: PriceBookId,
    /// Higher wins; ties broken by earliest `created_at`.
    pub priority: i32,
    #[serde(rename = "match")]
    pub match_spec: Value,
    #[serde(rename = "rule")]
    pub rule_spec: Value,
    pub created_at: DateTime<Utc>,
}

// ── Wallet configuration ──────────────────────────────────────────────────────

/// Per-team auto-top-up settings. A balance strictly below `threshold_minor`
/// triggers an off-session top-up of `top_up_amount_minor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub app_id: AppId,
    pub team_id: TeamId,
    pub auto_top_up_enabled: bool,
    pub threshold_minor: i64,
    pub top_up_amount_minor: i64,
}
