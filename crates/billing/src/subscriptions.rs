//! Maps gateway subscription-lifecycle events onto local subscription rows.
//!
//! Every handler is idempotent under duplicate delivery: subscription rows
//! upsert by gateway id, and the one ledger posting is keyed by the event id.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use meterline_entitlement::EntitlementService;
use meterline_ledger::{CreateEntry, LedgerService};
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{PlanId, SubscriptionId, TeamId};
use meterline_shared::ledger::{LedgerAccountType, LedgerEntryType, ReferenceType};
use meterline_shared::subscription::{SubscriptionStatus, TeamSubscription};
use meterline_shared::Clock;
use meterline_store::{Store, SubscriptionStore, TeamStore};

use crate::gateway::GatewayEvent;

#[derive(Clone)]
pub struct SubscriptionHandler {
    store: Arc<dyn Store>,
    ledger: LedgerService,
    entitlements: EntitlementService,
    clock: Arc<dyn Clock>,
}

impl SubscriptionHandler {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: LedgerService,
        entitlements: EntitlementService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            entitlements,
            clock,
        }
    }

    /// `checkout.session.completed` with mode=subscription: upsert the local
    /// subscription, post the charge once, refresh entitlements.
    pub async fn handle_checkout_completed(
        &self,
        event: &GatewayEvent,
    ) -> Result<(), ServiceError> {
        let session = &event.data.object;
        if session.get("mode").and_then(Value::as_str) != Some("subscription") {
            return Ok(());
        }
        let Some(team_id) = metadata_team_id(session) else {
            tracing::warn!(event = %event.id, "checkout completed without teamId metadata");
            return Ok(());
        };

        let Some(gateway_sub_id) = subscription_id_of(session) else {
            tracing::warn!(event = %event.id, "checkout completed without subscription id");
            return Ok(());
        };

        // Prefer the embedded subscription object when the gateway expanded
        // it; otherwise fall back to session-level defaults.
        let embedded = session
            .get("subscription")
            .filter(|v| v.is_object());
        let status = embedded
            .and_then(|s| s.get("status"))
            .and_then(Value::as_str)
            .map(SubscriptionStatus::from_gateway)
            .unwrap_or(SubscriptionStatus::Active);
        let (period_start, period_end) = embedded
            .map(|s| period_bounds_of(s))
            .unwrap_or((None, None));
        let seats = embedded.and_then(first_item_quantity).unwrap_or(1);

        let plan_id = session
            .get("metadata")
            .and_then(|m| m.get("planId"))
            .and_then(Value::as_str)
            .and_then(|raw| PlanId::from_str(raw).ok());

        let now = self.clock.now();
        self.store
            .upsert_subscription(TeamSubscription {
                id: SubscriptionId::new(),
                team_id,
                gateway_subscription_id: gateway_sub_id.clone(),
                status,
                plan_id,
                current_period_start: period_start,
                current_period_end: period_end,
                seats_quantity: seats.max(1),
                created_at: now,
                updated_at: now,
            })
            .await?;

        // Record the charge. amount_total is absent on zero-due sessions.
        if let Some(amount) = session.get("amount_total").and_then(Value::as_i64) {
            if amount != 0 {
                let entity = self
                    .store
                    .billing_entity_for_team(team_id)
                    .await?
                    .ok_or_else(|| ServiceError::internal("team has no billing entity"))?;
                let team = self
                    .store
                    .get_team(team_id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("team not found"))?;
                let result = self
                    .ledger
                    .create_entry(CreateEntry {
                        app_id: team.app_id,
                        bill_to_id: entity.id,
                        account_type: LedgerAccountType::Revenue,
                        entry_type: LedgerEntryType::SubscriptionCharge,
                        amount_minor: amount,
                        currency: session
                            .get("currency")
                            .and_then(Value::as_str)
                            .unwrap_or("usd")
                            .to_uppercase(),
                        reference_type: ReferenceType::GatewayEvent,
                        reference_id: session
                            .get("payment_intent")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                        idempotency_key: format!("checkout:{}", event.id),
                        metadata: json!({
                            "gatewaySubscriptionId": gateway_sub_id,
                            "sessionId": session.get("id"),
                        }),
                    })
                    .await;
                match result {
                    Ok(_) => {}
                    Err(err) if err.is_duplicate() => {
                        tracing::info!(event = %event.id, "checkout charge already posted");
                    }
                    Err(err) => return Err(ServiceError::internal(err.to_string())),
                }
            }
        }

        self.entitlements.refresh(team_id);
        Ok(())
    }

    /// `customer.subscription.updated`: sync status, period bounds and seat
    /// count. Unknown subscriptions are skipped, not created.
    pub async fn handle_subscription_updated(
        &self,
        event: &GatewayEvent,
    ) -> Result<(), ServiceError> {
        let object = &event.data.object;
        let Some(gateway_id) = object.get("id").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(existing) = self
            .store
            .get_subscription_by_gateway_id(gateway_id)
            .await?
        else {
            tracing::debug!(subscription = gateway_id, "update for unknown subscription");
            return Ok(());
        };

        let status = object
            .get("status")
            .and_then(Value::as_str)
            .map(SubscriptionStatus::from_gateway)
            .unwrap_or(existing.status);
        let (period_start, period_end) = period_bounds_of(object);
        let seats = first_item_quantity(object).unwrap_or(existing.seats_quantity);

        self.store
            .upsert_subscription(TeamSubscription {
                status,
                current_period_start: period_start.or(existing.current_period_start),
                current_period_end: period_end.or(existing.current_period_end),
                seats_quantity: seats.max(1),
                updated_at: self.clock.now(),
                ..existing.clone()
            })
            .await?;

        self.entitlements.refresh(existing.team_id);
        Ok(())
    }

    /// `customer.subscription.deleted`: terminal cancel.
    pub async fn handle_subscription_deleted(
        &self,
        event: &GatewayEvent,
    ) -> Result<(), ServiceError> {
        let object = &event.data.object;
        let Some(gateway_id) = object.get("id").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(existing) = self
            .store
            .get_subscription_by_gateway_id(gateway_id)
            .await?
        else {
            return Ok(());
        };

        self.store
            .upsert_subscription(TeamSubscription {
                status: SubscriptionStatus::Canceled,
                updated_at: self.clock.now(),
                ..existing.clone()
            })
            .await?;
        self.entitlements.refresh(existing.team_id);
        Ok(())
    }
}

fn metadata_team_id(object: &Value) -> Option<TeamId> {
    object
        .get("metadata")
        .and_then(|m| m.get("teamId"))
        .and_then(Value::as_str)
        .and_then(|raw| TeamId::from_str(raw).ok())
}

/// The subscription reference on a session is either the id string or an
/// expanded object.
fn subscription_id_of(session: &Value) -> Option<String> {
    match session.get("subscription") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned),
        _ => None,
    }
}

fn period_bounds_of(subscription: &Value) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let at = |key: &str| {
        subscription
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|unix| DateTime::from_timestamp(unix, 0))
    };
    (at("current_period_start"), at("current_period_end"))
}

fn first_item_quantity(subscription: &Value) -> Option<i64> {
    subscription
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .and_then(|item| item.get("quantity"))
        .and_then(Value::as_i64)
}
