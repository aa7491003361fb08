//! The polling pricing worker.
//!
//! One tick: pull due unpriced events oldest-first, price each, commit line
//! items + `priced_at` in one transaction, then fire immediate wallet debits
//! outside it. Duplicate delivery across worker processes is harmless because
//! the existing-line-items guard re-marks the event and moves on.
//!
//! Backoff: `next_retry_at = now + base * 2^(retry_count - 1)`, base 1s.
//! After `max_retries` transient failures the event is flagged permanent.

use std::sync::Arc;

use chrono::Duration;

use meterline_shared::ids::TeamId;
use meterline_shared::usage::{BillableLineItem, UsageEvent};
use meterline_shared::Clock;
use meterline_store::{Store, TeamStore, UsageStore};

use crate::engine::{PricingEngine, PricingError};
use crate::metrics::WorkerMetrics;
use crate::wallet::WalletDebitService;

const BACKOFF_BASE_SECS: i64 = 1;

/// Counters reported per tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct PricingWorker {
    store: Arc<dyn Store>,
    engine: PricingEngine,
    wallet: WalletDebitService,
    clock: Arc<dyn Clock>,
    metrics: Arc<WorkerMetrics>,
    batch_size: usize,
    max_retries: i32,
}

impl PricingWorker {
    pub fn new(
        store: Arc<dyn Store>,
        engine: PricingEngine,
        wallet: WalletDebitService,
        clock: Arc<dyn Clock>,
        metrics: Arc<WorkerMetrics>,
        batch_size: usize,
        max_retries: i32,
    ) -> Self {
        Self {
            store,
            engine,
            wallet,
            clock,
            metrics,
            batch_size,
            max_retries,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let now = self.clock.now();
        let events = match self.store.due_unpriced_events(now, self.batch_size).await {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(error = %err, "pricing poll failed");
                return TickOutcome::default();
            }
        };

        let mut outcome = TickOutcome::default();
        for event in events {
            match self.process_event(&event).await {
                Ok(true) => {
                    outcome.processed += 1;
                    WorkerMetrics::incr(&self.metrics.events_processed);
                }
                Ok(false) => {
                    outcome.skipped += 1;
                    WorkerMetrics::incr(&self.metrics.events_skipped);
                }
                Err(err) => {
                    outcome.failed += 1;
                    WorkerMetrics::incr(&self.metrics.events_failed);
                    self.handle_failure(&event, err).await;
                }
            }
        }
        if outcome != TickOutcome::default() {
            tracing::info!(
                processed = outcome.processed,
                skipped = outcome.skipped,
                failed = outcome.failed,
                "pricing tick"
            );
        }
        outcome
    }

    /// Returns Ok(true) when the event was priced, Ok(false) when the
    /// idempotency guard recovered an already-priced event.
    async fn process_event(&self, event: &UsageEvent) -> Result<bool, PricingError> {
        // Guard: line items already exist, so a previous run died between the
        // insert and the priced_at stamp (or another worker got here first).
        if !self.store.line_items_for_event(event.id).await?.is_empty() {
            self.store
                .mark_event_priced(event.id, self.clock.now())
                .await?;
            return Ok(false);
        }

        let team_id = self.resolve_team(event).await?;
        let drafts = self.engine.price_event(event).await?;

        let items: Vec<BillableLineItem> = drafts
            .into_iter()
            .map(|draft| BillableLineItem {
                id: meterline_shared::ids::LineItemId::new(),
                app_id: event.app_id,
                bill_to_id: event.bill_to_id,
                team_id,
                user_id: event.user_id.clone(),
                usage_event_id: Some(event.id),
                timestamp: event.timestamp,
                price_book_id: draft.price_book_id,
                price_rule_id: draft.price_rule_id,
                amount_minor: draft.amount_minor,
                currency: draft.currency,
                description: draft.description,
                inputs_snapshot: draft.inputs_snapshot,
                wallet_debited_at: None,
            })
            .collect();
        let item_ids: Vec<_> = items.iter().map(|i| i.id).collect();

        self.store
            .commit_pricing(event.id, items, self.clock.now())
            .await?;

        // After the commit: immediate debits. A failure here never unwinds
        // the pricing; the sweep picks the item up later.
        for item_id in item_ids {
            if let Err(err) = self.wallet.debit_immediate(item_id).await {
                tracing::warn!(line_item = %item_id, error = %err, "immediate debit failed");
            } else {
                WorkerMetrics::incr(&self.metrics.wallet_debits);
            }
        }

        Ok(true)
    }

    async fn resolve_team(&self, event: &UsageEvent) -> Result<TeamId, PricingError> {
        if let Some(team_id) = event.team_id {
            return Ok(team_id);
        }
        self.store
            .team_for_bill_to(event.bill_to_id)
            .await?
            .map(|team| team.id)
            .ok_or_else(|| {
                PricingError::InvalidRule(format!(
                    "event {} has no resolvable team",
                    event.id
                ))
            })
    }

    async fn handle_failure(&self, event: &UsageEvent, err: PricingError) {
        if err.is_permanent() {
            self.flag_permanent(event, &err).await;
            return;
        }

        let retry_count = event.retry_count + 1;
        if retry_count > self.max_retries {
            self.flag_permanent(event, &err).await;
            return;
        }

        let delay = BACKOFF_BASE_SECS << (retry_count - 1);
        let next_retry_at = self.clock.now() + Duration::seconds(delay);
        tracing::warn!(
            event = %event.id,
            retry = retry_count,
            next_retry_in_secs = delay,
            error = %err,
            "transient pricing failure"
        );
        if let Err(store_err) = self
            .store
            .record_pricing_failure(event.id, retry_count, Some(next_retry_at))
            .await
        {
            tracing::error!(event = %event.id, error = %store_err, "failed to record retry state");
        }
    }

    /// Flag and forget: mark the event priced with no line items so it never
    /// comes back, and leave the evidence in the log and the counter.
    async fn flag_permanent(&self, event: &UsageEvent, err: &PricingError) {
        WorkerMetrics::incr(&self.metrics.permanent_pricing_failures);
        tracing::error!(
            event = %event.id,
            app = %event.app_id,
            event_type = %event.event_type,
            error = %err,
            "permanent pricing failure"
        );
        if let Err(store_err) = self
            .store
            .mark_event_priced(event.id, self.clock.now())
            .await
        {
            tracing::error!(event = %event.id, error = %store_err, "failed to flag event");
        }
    }
}
