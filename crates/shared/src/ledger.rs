//! Double-entry ledger rows.
//!
//! Entries are append-only and carry a globally unique idempotency key; the
//! unique insert is the authoritative "already done" signal for every caller
//! that retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AppId, BillToId, LedgerAccountId, LedgerEntryId};

// ── Accounts ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerAccountType {
    Wallet,
    AccountsReceivable,
    Revenue,
    Cogs,
    Tax,
}

impl LedgerAccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAccountType::Wallet => "WALLET",
            LedgerAccountType::AccountsReceivable => "ACCOUNTS_RECEIVABLE",
            LedgerAccountType::Revenue => "REVENUE",
            LedgerAccountType::Cogs => "COGS",
            LedgerAccountType::Tax => "TAX",
        }
    }
}

/// Unique on `(app_id, bill_to_id, type)`; created lazily on first post.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerAccount {
    pub id: LedgerAccountId,
    pub app_id: AppId,
    pub bill_to_id: BillToId,
    #[serde(rename = "type")]
    pub account_type: LedgerAccountType,
    pub created_at: DateTime<Utc>,
}

// ── Entries ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    Topup,
    SubscriptionCharge,
    UsageCharge,
    Refund,
    Adjustment,
    InvoicePayment,
    CogsAccrual,
}

/// What a ledger entry points back at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    UsageEvent,
    LineItem,
    Invoice,
    GatewayEvent,
    Subscription,
    Manual,
}

/// Sign convention: the caller provides the signed amount. TOPUP and REFUND
/// are positive on WALLET; USAGE_CHARGE and SUBSCRIPTION_CHARGE are negative
/// on WALLET. No automatic flipping happens anywhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub app_id: AppId,
    pub bill_to_id: BillToId,
    pub ledger_account_id: LedgerAccountId,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub amount_minor: i64,
    pub currency: String,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    /// Globally unique across all tenants.
    pub idempotency_key: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}
