//! Usage events and the line items priced out of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{
    AppId, BillToId, LineItemId, PriceBookId, PriceRuleId, TeamId, UsageEventId, UserId,
};

// ── Usage events ──────────────────────────────────────────────────────────────

/// A raw usage event as ingested. `priced_at` is the terminal marker: once
/// set, the pricing worker never touches the event again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub id: UsageEventId,
    pub app_id: AppId,
    pub team_id: Option<TeamId>,
    pub user_id: Option<UserId>,
    pub bill_to_id: BillToId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Unique per `(app_id, idempotency_key)`.
    pub idempotency_key: String,
    pub payload: Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub priced_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Ingestion input, before ids and dedup. `team_id` falls back to the
/// token's team claim when absent.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUsageEvent {
    pub event_type: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

// ── Line items ────────────────────────────────────────────────────────────────

/// What the pricing engine emits for one `(event, price book)` pair before it
/// is persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemDraft {
    pub price_book_id: PriceBookId,
    pub price_rule_id: PriceRuleId,
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    /// Carries `eventType`, the matched rule id, the inputs read from the
    /// payload, and the computed amount, for audits and aggregation.
    pub inputs_snapshot: Value,
}

/// Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillableLineItem {
    pub id: LineItemId,
    pub app_id: AppId,
    pub bill_to_id: BillToId,
    pub team_id: TeamId,
    pub user_id: Option<UserId>,
    pub usage_event_id: Option<UsageEventId>,
    pub timestamp: DateTime<Utc>,
    pub price_book_id: PriceBookId,
    pub price_rule_id: PriceRuleId,
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    pub inputs_snapshot: Value,
    pub wallet_debited_at: Option<DateTime<Utc>>,
}

impl BillableLineItem {
    /// Event type recorded in the snapshot at pricing time, used by period
    /// close and the aggregation endpoints.
    pub fn snapshot_event_type(&self) -> &str {
        self.inputs_snapshot
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}
