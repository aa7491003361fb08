//! Webhook dispatcher: verify the gateway signature, route by event type,
//! stay idempotent under replays and reordering.
//!
//! Replays are caught by the ledger idempotency keys the handlers use
//! (`topup:<eventId>`, `checkout:<eventId>`), never by remembering event ids.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};

use meterline_ledger::{CreateEntry, LedgerService};
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, TeamId};
use meterline_shared::ledger::{LedgerAccountType, LedgerEntryType, ReferenceType};
use meterline_shared::Clock;
use meterline_store::{Store, TeamStore};

use crate::gateway::{GatewayEvent, WebhookVerifier};
use crate::subscriptions::SubscriptionHandler;

/// What the dispatcher did with one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// Event type has no handler; acknowledged so the gateway stops retrying.
    Ignored,
}

pub struct WebhookDispatcher {
    verifier: WebhookVerifier,
    store: Arc<dyn Store>,
    ledger: LedgerService,
    subscriptions: SubscriptionHandler,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatcher {
    pub fn new(
        verifier: WebhookVerifier,
        store: Arc<dyn Store>,
        ledger: LedgerService,
        subscriptions: SubscriptionHandler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier,
            store,
            ledger,
            subscriptions,
            clock,
        }
    }

    pub async fn dispatch(
        &self,
        body: &str,
        signature_header: &str,
    ) -> Result<DispatchOutcome, ServiceError> {
        let event = self
            .verifier
            .verify(body, signature_header, self.clock.now().timestamp())
            .map_err(ServiceError::from)?;
        self.route(&event).await
    }

    pub async fn route(&self, event: &GatewayEvent) -> Result<DispatchOutcome, ServiceError> {
        tracing::info!(event = %event.id, event_type = %event.event_type, "gateway event");
        match event.event_type.as_str() {
            "checkout.session.completed" => {
                self.subscriptions.handle_checkout_completed(event).await?;
                Ok(DispatchOutcome::Handled)
            }
            "customer.subscription.updated" => {
                self.subscriptions.handle_subscription_updated(event).await?;
                Ok(DispatchOutcome::Handled)
            }
            "customer.subscription.deleted" => {
                self.subscriptions.handle_subscription_deleted(event).await?;
                Ok(DispatchOutcome::Handled)
            }
            "payment_intent.succeeded" => self.handle_payment_intent_succeeded(event).await,
            other => {
                tracing::info!(event_type = other, "unhandled gateway event type");
                Ok(DispatchOutcome::Ignored)
            }
        }
    }

    /// Wallet top-ups arrive as `payment_intent.succeeded` carrying the
    /// metadata the checkout driver stamped on the intent.
    async fn handle_payment_intent_succeeded(
        &self,
        event: &GatewayEvent,
    ) -> Result<DispatchOutcome, ServiceError> {
        let intent = &event.data.object;
        let metadata = intent.get("metadata").cloned().unwrap_or(Value::Null);
        if metadata.get("type").and_then(Value::as_str) != Some("wallet_topup") {
            return Ok(DispatchOutcome::Ignored);
        }

        let (Some(team_id), Some(app_id)) = (
            metadata
                .get("teamId")
                .and_then(Value::as_str)
                .and_then(|raw| TeamId::from_str(raw).ok()),
            metadata
                .get("appId")
                .and_then(Value::as_str)
                .and_then(|raw| AppId::from_str(raw).ok()),
        ) else {
            tracing::warn!(event = %event.id, "wallet_topup intent without team/app metadata");
            return Ok(DispatchOutcome::Ignored);
        };

        let amount = intent
            .get("amount_received")
            .or_else(|| intent.get("amount"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if amount <= 0 {
            tracing::warn!(event = %event.id, "wallet_topup intent with no amount");
            return Ok(DispatchOutcome::Ignored);
        }

        let entity = self
            .store
            .billing_entity_for_team(team_id)
            .await?
            .ok_or_else(|| ServiceError::internal("team has no billing entity"))?;

        let result = self
            .ledger
            .create_entry(CreateEntry {
                app_id,
                bill_to_id: entity.id,
                account_type: LedgerAccountType::Wallet,
                entry_type: LedgerEntryType::Topup,
                amount_minor: amount,
                currency: intent
                    .get("currency")
                    .and_then(Value::as_str)
                    .unwrap_or("usd")
                    .to_uppercase(),
                reference_type: ReferenceType::GatewayEvent,
                reference_id: intent
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                idempotency_key: format!("topup:{}", event.id),
                metadata: json!({
                    "teamId": team_id,
                    "trigger": metadata.get("trigger"),
                }),
            })
            .await;
        match result {
            Ok(entry) => {
                tracing::info!(team = %team_id, amount, entry = %entry.id, "wallet topped up");
                Ok(DispatchOutcome::Handled)
            }
            Err(err) if err.is_duplicate() => {
                tracing::info!(event = %event.id, "top-up already credited");
                Ok(DispatchOutcome::Handled)
            }
            Err(err) => Err(ServiceError::internal(err.to_string())),
        }
    }
}
