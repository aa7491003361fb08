//! Enterprise agreements: bundles, meter policies, contracts and overrides.
//!
//! A bundle is the catalog of defaults a contract attaches to; contract
//! overrides shadow individual `(app, meter)` entries. The entitlement
//! resolver owns the merge order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AppId, BillToId, BundleId, ContractId};

// ── Meter policy ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    None,
    Included,
    Unlimited,
    HardCap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Enforcement {
    None,
    Soft,
    Hard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverageBilling {
    None,
    PerUnit,
    Tiered,
    Custom,
}

/// Policy for one meter key. The same shape is used at the bundle layer and
/// the contract-override layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterPolicy {
    pub limit_type: LimitType,
    pub included_amount: Option<i64>,
    pub enforcement: Enforcement,
    pub overage_billing: OverageBilling,
}

// ── Bundle ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleStatus {
    Active,
    Retired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub id: BundleId,
    /// Globally unique.
    pub code: String,
    pub name: String,
    pub status: BundleStatus,
    pub created_at: DateTime<Utc>,
}

/// Default feature flags a bundle grants for one app.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleApp {
    pub bundle_id: BundleId,
    pub app_id: AppId,
    pub default_feature_flags: Value,
}

/// Unique on `(bundle_id, app_id, meter_key)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMeterPolicy {
    pub bundle_id: BundleId,
    pub app_id: AppId,
    pub meter_key: String,
    #[serde(flatten)]
    pub policy: MeterPolicy,
}

// ── Contract ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingPeriod {
    Monthly,
    Quarterly,
}

impl BillingPeriod {
    /// Period length in calendar months.
    pub fn months(&self) -> u32 {
        match self {
            BillingPeriod::Monthly => 1,
            BillingPeriod::Quarterly => 3,
        }
    }
}

/// Strategy for turning a closed period's usage into invoice lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PricingMode {
    Fixed,
    FixedPlusTrueup,
    MinCommitTrueup,
    CustomInvoiceOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Draft,
    Active,
    Paused,
    Ended,
}

/// At most one ACTIVE contract per `bill_to_id`; the activation path re-checks
/// inside its transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: ContractId,
    pub bill_to_id: BillToId,
    pub bundle_id: BundleId,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub terms_days: i64,
    pub pricing_mode: PricingMode,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub status: ContractStatus,
    pub created_at: DateTime<Utc>,
}

/// Shadows the bundle's entry for the same `(app, meter)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOverride {
    pub contract_id: ContractId,
    pub app_id: AppId,
    pub meter_key: String,
    #[serde(flatten)]
    pub policy: MeterPolicy,
}
