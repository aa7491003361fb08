//! Invoices produced by period close.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AppId, BillToId, ContractId, InvoiceId, InvoiceLineId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
}

/// Unique on `(contract_id, period_start, period_end)`; re-running period
/// close for the same period finds this row and repairs its ledger entries
/// instead of inserting a second invoice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: InvoiceId,
    pub contract_id: ContractId,
    pub bill_to_id: BillToId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: InvoiceStatus,
    pub subtotal_minor: i64,
    pub tax_minor: i64,
    pub total_minor: i64,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceLineType {
    BaseFee,
    UsageTrueup,
    Addon,
    Credit,
    Adjustment,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineItem {
    pub id: InvoiceLineId,
    pub invoice_id: InvoiceId,
    /// Zero-based emission order; ledger idempotency keys and the repair pass
    /// iterate lines by this index, so it must be stable across re-reads.
    pub position: i32,
    pub app_id: Option<AppId>,
    #[serde(rename = "type")]
    pub line_type: InvoiceLineType,
    pub description: String,
    pub quantity: i64,
    pub unit_price_minor: i64,
    pub amount_minor: i64,
    /// Per-meter detail (totals, counts) for lines whose amount is carried
    /// elsewhere on the invoice.
    pub usage_summary: Option<Value>,
}
