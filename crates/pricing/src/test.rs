//! Tests for the pricing pipeline.
//!
//! Covers:
//! - Rule decoding strictness and amount math (flat, per-unit ceiling, tiers)
//! - Match conjunction over eventType + payload scalars
//! - Book/rule selection: priority, created-at tie break, effective-from
//! - COGS-required / CUSTOMER-optional book semantics
//! - Worker tick: pricing commit, idempotency guard, permanent flagging
//! - Immediate wallet debit and the batch sweep

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use meterline_ledger::LedgerService;
use meterline_shared::catalog::{PriceBook, PriceBookKind, PriceRule};
use meterline_shared::ids::{AppId, BillToId, PriceBookId, PriceRuleId, TeamId, UsageEventId};
use meterline_shared::ledger::LedgerAccountType;
use meterline_shared::tenant::{BillingEntity, BillingMode, ExternalTeamRef, Team, TeamKind};
use meterline_shared::usage::UsageEvent;
use meterline_shared::{Clock, FixedClock};
use meterline_store::{CatalogStore, LedgerStore, MemoryStore, TeamStore, UsageStore};

use crate::engine::{PricingEngine, PricingError};
use crate::metrics::WorkerMetrics;
use crate::rules::{MatchSpec, RuleSpec};
use crate::wallet::{DebitOutcome, NoopAutoTopUp, WalletDebitService};
use crate::worker::{PricingWorker, TickOutcome};

fn ts() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap()
}

// ── Rule math ─────────────────────────────────────────────────────────────────

#[test]
fn test_flat_rule() {
    let spec = RuleSpec::decode(&json!({"type": "flat", "amount": 250})).unwrap();
    let (amount, _) = spec.evaluate(&json!({})).unwrap();
    assert_eq!(amount, 250);
}

#[test]
fn test_per_unit_rounds_up() {
    let spec =
        RuleSpec::decode(&json!({"type": "per_unit", "field": "tokens", "unitPrice": 0.003}))
            .unwrap();
    // 1000 * 0.003 = 3.0 exactly
    assert_eq!(spec.evaluate(&json!({"tokens": 1000})).unwrap().0, 3);
    // 1001 * 0.003 = 3.003 → 4
    assert_eq!(spec.evaluate(&json!({"tokens": 1001})).unwrap().0, 4);
    assert_eq!(spec.evaluate(&json!({"tokens": 0})).unwrap().0, 0);
}

#[test]
fn test_tiered_is_piecewise() {
    let spec = RuleSpec::decode(&json!({
        "type": "tiered",
        "field": "units",
        "tiers": [
            {"upTo": 100, "unitPrice": 2.0},
            {"upTo": 200, "unitPrice": 1.0},
            {"upTo": null, "unitPrice": 0.5},
        ]
    }))
    .unwrap();
    // 50 in tier 1
    assert_eq!(spec.evaluate(&json!({"units": 50})).unwrap().0, 100);
    // 100*2 + 50*1
    assert_eq!(spec.evaluate(&json!({"units": 150})).unwrap().0, 250);
    // 100*2 + 100*1 + 100*0.5
    assert_eq!(spec.evaluate(&json!({"units": 300})).unwrap().0, 350);
}

#[test]
fn test_rule_decode_rejections() {
    assert!(RuleSpec::decode(&json!({"type": "percentage", "rate": 3})).is_err());
    assert!(RuleSpec::decode(&json!({"type": "flat"})).is_err());
    assert!(RuleSpec::decode(&json!({"type": "per_unit", "field": "x"})).is_err());
    assert!(RuleSpec::decode(&json!({"type": "tiered", "field": "x", "tiers": []})).is_err());
    // Unbounded tier anywhere but last.
    assert!(RuleSpec::decode(&json!({
        "type": "tiered",
        "field": "x",
        "tiers": [{"upTo": null, "unitPrice": 1}, {"upTo": 10, "unitPrice": 1}]
    }))
    .is_err());
    assert!(RuleSpec::decode(&json!("flat")).is_err());
}

#[test]
fn test_evaluation_rejects_bad_payloads() {
    let spec =
        RuleSpec::decode(&json!({"type": "per_unit", "field": "n", "unitPrice": 1})).unwrap();
    assert!(spec.evaluate(&json!({})).is_err());
    assert!(spec.evaluate(&json!({"n": "many"})).is_err());
    assert!(spec.evaluate(&json!({"n": -4})).is_err());
}

#[test]
fn test_match_spec_conjunction() {
    let spec = MatchSpec::decode(&json!({"eventType": "llm.completion.v1", "model": "m-4"}))
        .unwrap();
    assert!(spec.matches("llm.completion.v1", &json!({"model": "m-4", "tokens": 7})));
    assert!(!spec.matches("llm.completion.v1", &json!({"model": "m-5"})));
    assert!(!spec.matches("api.request.v1", &json!({"model": "m-4"})));

    // Non-scalar match values are rejected at decode time.
    assert!(MatchSpec::decode(&json!({"payload": {"a": 1}})).is_err());
    // Empty match matches everything.
    let any = MatchSpec::decode(&json!({})).unwrap();
    assert!(any.matches("whatever", &json!({})));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Ceiling never under-bills: amount >= units * price, and overshoot is
    /// under one minor unit.
    #[test]
    fn prop_per_unit_ceiling(units in 0u32..2_000_000, price_millis in 0u32..50_000) {
        let price = f64::from(price_millis) / 1000.0;
        let spec = RuleSpec::decode(
            &json!({"type": "per_unit", "field": "u", "unitPrice": price}),
        ).unwrap();
        let (amount, _) = spec.evaluate(&json!({"u": units})).unwrap();
        let exact = f64::from(units) * price;
        prop_assert!(amount as f64 >= exact);
        prop_assert!((amount as f64) < exact + 1.0);
    }
}

// ── Fixture ───────────────────────────────────────────────────────────────────

struct Fixture {
    store: Arc<MemoryStore>,
    clock: FixedClock,
    app_id: AppId,
    team_id: TeamId,
    bill_to: BillToId,
    customer_book: PriceBookId,
    cogs_book: PriceBookId,
}

impl Fixture {
    async fn new(billing_mode: BillingMode) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = FixedClock::at(ts());
        let app_id = AppId::new();

        let team = Team {
            id: TeamId::new(),
            app_id,
            name: "acme".into(),
            kind: TeamKind::Standard,
            owner_user_id: None,
            default_currency: "USD".into(),
            stripe_customer_id: None,
            billing_mode,
            created_at: ts(),
        };
        let entity = BillingEntity {
            id: BillToId::new(),
            team_id: team.id,
        };
        let (team_id, bill_to) = (team.id, entity.id);
        store
            .create_team(
                team,
                entity,
                ExternalTeamRef {
                    app_id,
                    external_team_id: "ext".into(),
                    team_id,
                },
            )
            .await
            .unwrap();

        let fixture = Self {
            store,
            clock,
            app_id,
            team_id,
            bill_to,
            customer_book: PriceBookId::new(),
            cogs_book: PriceBookId::new(),
        };
        fixture
            .add_book(fixture.cogs_book, PriceBookKind::Cogs, ts() - Duration::days(30))
            .await;
        fixture
            .add_book(
                fixture.customer_book,
                PriceBookKind::Customer,
                ts() - Duration::days(30),
            )
            .await;
        fixture
    }

    async fn add_book(&self, id: PriceBookId, kind: PriceBookKind, from: chrono::DateTime<Utc>) {
        self.store
            .insert_price_book(PriceBook {
                id,
                app_id: self.app_id,
                kind,
                currency: "USD".into(),
                effective_from: from,
                created_at: from,
            })
            .await
            .unwrap();
    }

    async fn add_rule(&self, book: PriceBookId, priority: i32, rule: serde_json::Value) {
        self.add_rule_at(book, priority, rule, ts() - Duration::days(30)).await;
    }

    async fn add_rule_at(
        &self,
        book: PriceBookId,
        priority: i32,
        rule: serde_json::Value,
        created_at: chrono::DateTime<Utc>,
    ) {
        self.store
            .insert_price_rule(PriceRule {
                id: PriceRuleId::new(),
                price_book_id: book,
                priority,
                match_spec: json!({}),
                rule_spec: rule,
                created_at,
            })
            .await
            .unwrap();
    }

    fn event(&self, payload: serde_json::Value) -> UsageEvent {
        UsageEvent {
            id: UsageEventId::new(),
            app_id: self.app_id,
            team_id: Some(self.team_id),
            user_id: None,
            bill_to_id: self.bill_to,
            event_type: "llm.completion.v1".into(),
            timestamp: ts(),
            idempotency_key: UsageEventId::new().to_string(),
            payload,
            source: "sdk".into(),
            created_at: ts(),
            priced_at: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    fn engine(&self) -> PricingEngine {
        PricingEngine::new(self.store.clone())
    }

    fn worker(&self) -> PricingWorker {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let ledger = LedgerService::new(self.store.clone(), clock.clone());
        let wallet = WalletDebitService::new(
            self.store.clone(),
            ledger,
            clock.clone(),
            Arc::new(NoopAutoTopUp),
        );
        PricingWorker::new(
            self.store.clone(),
            self.engine(),
            wallet,
            clock,
            Arc::new(WorkerMetrics::new()),
            50,
            5,
        )
    }

    async fn wallet_balance(&self) -> i64 {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let ledger = LedgerService::new(self.store.clone(), clock);
        ledger.wallet_balance(self.app_id, self.bill_to).await.unwrap()
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_event_prices_both_sides() {
    let fx = Fixture::new(BillingMode::Subscription).await;
    fx.add_rule(
        fx.cogs_book,
        0,
        json!({"type": "per_unit", "field": "inputTokens", "unitPrice": 1}),
    )
    .await;
    fx.add_rule(
        fx.customer_book,
        0,
        json!({"type": "per_unit", "field": "inputTokens", "unitPrice": 3}),
    )
    .await;

    let drafts = fx
        .engine()
        .price_event(&fx.event(json!({"inputTokens": 1000})))
        .await
        .unwrap();
    assert_eq!(drafts.len(), 2);
    assert_eq!(drafts[0].amount_minor, 1000);
    assert_eq!(drafts[1].amount_minor, 3000);
    assert_eq!(
        drafts[1].inputs_snapshot["eventType"],
        json!("llm.completion.v1")
    );
}

#[tokio::test]
async fn test_priority_and_created_at_tiebreak() {
    let fx = Fixture::new(BillingMode::Subscription).await;
    fx.add_rule(fx.cogs_book, 0, json!({"type": "flat", "amount": 1})).await;
    fx.add_rule(fx.customer_book, 1, json!({"type": "flat", "amount": 10})).await;
    fx.add_rule(fx.customer_book, 5, json!({"type": "flat", "amount": 50})).await;
    // Same priority as the winner but created later: must lose.
    fx.add_rule_at(
        fx.customer_book,
        5,
        json!({"type": "flat", "amount": 99}),
        ts() - Duration::days(1),
    )
    .await;

    let drafts = fx.engine().price_event(&fx.event(json!({}))).await.unwrap();
    assert_eq!(drafts[1].amount_minor, 50);
}

#[tokio::test]
async fn test_missing_books_and_rules() {
    // No COGS book at all: permanent NO_PRICEBOOK.
    let fx = Fixture::new(BillingMode::Subscription).await;
    let store = MemoryStore::new();
    let engine = PricingEngine::new(Arc::new(store));
    let err = engine.price_event(&fx.event(json!({}))).await.unwrap_err();
    assert!(matches!(err, PricingError::NoPriceBook("COGS")));
    assert!(err.is_permanent());

    // Books exist but no rule matches: NO_MATCHING_RULE.
    let fx = Fixture::new(BillingMode::Subscription).await;
    let err = fx.engine().price_event(&fx.event(json!({}))).await.unwrap_err();
    assert!(matches!(err, PricingError::NoMatchingRule("COGS")));
}

#[tokio::test]
async fn test_cogs_only_app_prices_single_side() {
    let store = Arc::new(MemoryStore::new());
    let fx = Fixture::new(BillingMode::Subscription).await;
    // Fresh store with only a COGS book for this app.
    let engine = PricingEngine::new(store.clone());
    let cogs = PriceBookId::new();
    store
        .insert_price_book(PriceBook {
            id: cogs,
            app_id: fx.app_id,
            kind: PriceBookKind::Cogs,
            currency: "USD".into(),
            effective_from: ts() - Duration::days(1),
            created_at: ts() - Duration::days(1),
        })
        .await
        .unwrap();
    store
        .insert_price_rule(PriceRule {
            id: PriceRuleId::new(),
            price_book_id: cogs,
            priority: 0,
            match_spec: json!({}),
            rule_spec: json!({"type": "flat", "amount": 7}),
            created_at: ts() - Duration::days(1),
        })
        .await
        .unwrap();

    let drafts = engine.price_event(&fx.event(json!({}))).await.unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].amount_minor, 7);
}

#[tokio::test]
async fn test_future_book_is_not_effective() {
    let fx = Fixture::new(BillingMode::Subscription).await;
    fx.add_rule(fx.cogs_book, 0, json!({"type": "flat", "amount": 1})).await;
    fx.add_rule(fx.customer_book, 0, json!({"type": "flat", "amount": 2})).await;
    // A newer CUSTOMER book effective after the event changes nothing.
    let future_book = PriceBookId::new();
    fx.add_book(future_book, PriceBookKind::Customer, ts() + Duration::days(1)).await;
    fx.add_rule(future_book, 9, json!({"type": "flat", "amount": 999})).await;

    let drafts = fx.engine().price_event(&fx.event(json!({}))).await.unwrap();
    assert_eq!(drafts[1].amount_minor, 2);
}

// ── Worker ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tick_prices_event_and_debits_wallet() {
    let fx = Fixture::new(BillingMode::Wallet).await;
    fx.add_rule(
        fx.cogs_book,
        0,
        json!({"type": "per_unit", "field": "inputTokens", "unitPrice": 1}),
    )
    .await;
    fx.add_rule(
        fx.customer_book,
        0,
        json!({"type": "per_unit", "field": "inputTokens", "unitPrice": 3}),
    )
    .await;

    let event = fx.event(json!({"inputTokens": 1000}));
    fx.store.insert_events(vec![event.clone()]).await.unwrap();

    let outcome = fx.worker().tick().await;
    assert_eq!(outcome, TickOutcome { processed: 1, skipped: 0, failed: 0 });

    let stored = fx.store.get_event(event.id).await.unwrap().unwrap();
    assert!(stored.priced_at.is_some());

    let items = fx.store.line_items_for_event(event.id).await.unwrap();
    assert_eq!(items.len(), 2);

    // Exactly one WALLET debit, for the CUSTOMER side.
    assert_eq!(fx.wallet_balance().await, -3000);
    let customer_item = items
        .iter()
        .find(|i| i.price_book_id == fx.customer_book)
        .unwrap();
    let entry = fx
        .store
        .get_entry_by_idempotency_key(&format!("wallet-debit:{}", customer_item.id))
        .await
        .unwrap()
        .expect("debit entry exists");
    assert_eq!(entry.amount_minor, -3000);
    let customer_item = fx
        .store
        .get_line_item(customer_item.id)
        .await
        .unwrap()
        .unwrap();
    assert!(customer_item.wallet_debited_at.is_some());

    // Second tick: nothing due anymore.
    let outcome = fx.worker().tick().await;
    assert_eq!(outcome, TickOutcome::default());
    assert_eq!(fx.wallet_balance().await, -3000);
}

#[tokio::test]
async fn test_guard_recovers_half_committed_event() {
    let fx = Fixture::new(BillingMode::Subscription).await;
    fx.add_rule(fx.cogs_book, 0, json!({"type": "flat", "amount": 5})).await;
    fx.add_rule(fx.customer_book, 0, json!({"type": "flat", "amount": 9})).await;

    let target = fx.event(json!({}));
    // The sacrificial event absorbs the priced_at stamp so `target` ends up
    // exactly in the crash window: line items exist, priced_at is NULL.
    let sacrificial = fx.event(json!({}));
    fx.store
        .insert_events(vec![target.clone(), sacrificial.clone()])
        .await
        .unwrap();

    let drafts = fx.engine().price_event(&target).await.unwrap();
    let items: Vec<_> = drafts
        .into_iter()
        .map(|d| meterline_shared::usage::BillableLineItem {
            id: meterline_shared::ids::LineItemId::new(),
            app_id: target.app_id,
            bill_to_id: target.bill_to_id,
            team_id: fx.team_id,
            user_id: None,
            usage_event_id: Some(target.id),
            timestamp: target.timestamp,
            price_book_id: d.price_book_id,
            price_rule_id: d.price_rule_id,
            amount_minor: d.amount_minor,
            currency: d.currency,
            description: d.description,
            inputs_snapshot: d.inputs_snapshot,
            wallet_debited_at: None,
        })
        .collect();
    fx.store
        .commit_pricing(sacrificial.id, items, ts())
        .await
        .unwrap();

    let outcome = fx.worker().tick().await;
    assert_eq!(outcome, TickOutcome { processed: 0, skipped: 1, failed: 0 });

    let stored = fx.store.get_event(target.id).await.unwrap().unwrap();
    assert!(stored.priced_at.is_some(), "recovery path stamps priced_at");
    // Still exactly the two original items; nothing was double-priced.
    assert_eq!(fx.store.line_items_for_event(target.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_permanent_failure_flags_event() {
    let fx = Fixture::new(BillingMode::Subscription).await;
    fx.add_rule(fx.cogs_book, 0, json!({"type": "bogus"})).await;

    let event = fx.event(json!({}));
    fx.store.insert_events(vec![event.clone()]).await.unwrap();

    let outcome = fx.worker().tick().await;
    assert_eq!(outcome, TickOutcome { processed: 0, skipped: 0, failed: 1 });

    let stored = fx.store.get_event(event.id).await.unwrap().unwrap();
    assert!(stored.priced_at.is_some(), "flag-and-forget sets priced_at");
    assert!(fx.store.line_items_for_event(event.id).await.unwrap().is_empty());
}

// ── Wallet debit ──────────────────────────────────────────────────────────────

async fn priced_fixture(mode: BillingMode) -> (Fixture, meterline_shared::usage::BillableLineItem) {
    let fx = Fixture::new(mode).await;
    fx.add_rule(fx.cogs_book, 0, json!({"type": "flat", "amount": 100})).await;
    fx.add_rule(fx.customer_book, 0, json!({"type": "flat", "amount": 300})).await;
    let event = fx.event(json!({}));
    fx.store.insert_events(vec![event.clone()]).await.unwrap();

    // Price without debiting: use a worker on a non-wallet team path by
    // committing directly.
    let drafts = fx.engine().price_event(&event).await.unwrap();
    let items: Vec<_> = drafts
        .into_iter()
        .map(|d| meterline_shared::usage::BillableLineItem {
            id: meterline_shared::ids::LineItemId::new(),
            app_id: event.app_id,
            bill_to_id: event.bill_to_id,
            team_id: fx.team_id,
            user_id: None,
            usage_event_id: Some(event.id),
            timestamp: event.timestamp,
            price_book_id: d.price_book_id,
            price_rule_id: d.price_rule_id,
            amount_minor: d.amount_minor,
            currency: d.currency,
            description: d.description,
            inputs_snapshot: d.inputs_snapshot,
            wallet_debited_at: None,
        })
        .collect();
    fx.store.commit_pricing(event.id, items.clone(), ts()).await.unwrap();
    let customer_item = items
        .into_iter()
        .find(|i| i.price_book_id == fx.customer_book)
        .unwrap();
    (fx, customer_item)
}

fn wallet_service(fx: &Fixture) -> WalletDebitService {
    let clock: Arc<dyn Clock> = Arc::new(fx.clock.clone());
    WalletDebitService::new(
        fx.store.clone(),
        LedgerService::new(fx.store.clone(), clock.clone()),
        clock,
        Arc::new(NoopAutoTopUp),
    )
}

#[tokio::test]
async fn test_debit_immediate_is_idempotent() {
    let (fx, item) = priced_fixture(BillingMode::Wallet).await;
    let wallet = wallet_service(&fx);

    let outcome = wallet.debit_immediate(item.id).await.unwrap();
    assert!(matches!(outcome, DebitOutcome::Debited(_)));
    assert_eq!(fx.wallet_balance().await, -300);

    // Already stamped: skipped without touching the ledger.
    let outcome = wallet.debit_immediate(item.id).await.unwrap();
    assert_eq!(outcome, DebitOutcome::Skipped);
    assert_eq!(fx.wallet_balance().await, -300);
}

#[tokio::test]
async fn test_debit_skips_non_wallet_and_cogs() {
    let (fx, customer_item) = priced_fixture(BillingMode::Subscription).await;
    let wallet = wallet_service(&fx);
    assert_eq!(
        wallet.debit_immediate(customer_item.id).await.unwrap(),
        DebitOutcome::Skipped
    );

    let (fx, _) = priced_fixture(BillingMode::Wallet).await;
    let wallet = wallet_service(&fx);
    let cogs_item = fx
        .store
        .undebited_line_items(10)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.price_book_id == fx.cogs_book)
        .unwrap();
    assert_eq!(
        wallet.debit_immediate(cogs_item.id).await.unwrap(),
        DebitOutcome::Skipped
    );
    assert_eq!(fx.wallet_balance().await, 0);
}

#[tokio::test]
async fn test_batch_sweep_aggregates_per_bill_to() {
    let (fx, _) = priced_fixture(BillingMode::Wallet).await;
    // A second priced event, also undebited.
    let event = fx.event(json!({}));
    fx.store.insert_events(vec![event.clone()]).await.unwrap();
    let drafts = fx.engine().price_event(&event).await.unwrap();
    let items: Vec<_> = drafts
        .into_iter()
        .map(|d| meterline_shared::usage::BillableLineItem {
            id: meterline_shared::ids::LineItemId::new(),
            app_id: event.app_id,
            bill_to_id: event.bill_to_id,
            team_id: fx.team_id,
            user_id: None,
            usage_event_id: Some(event.id),
            timestamp: event.timestamp,
            price_book_id: d.price_book_id,
            price_rule_id: d.price_rule_id,
            amount_minor: d.amount_minor,
            currency: d.currency,
            description: d.description,
            inputs_snapshot: d.inputs_snapshot,
            wallet_debited_at: None,
        })
        .collect();
    fx.store.commit_pricing(event.id, items, ts()).await.unwrap();

    let wallet = wallet_service(&fx);
    let debited = wallet.debit_batch(100).await.unwrap();
    // Two CUSTOMER items (300 each) in one aggregated debit.
    assert_eq!(debited, 2);
    assert_eq!(fx.wallet_balance().await, -600);

    // Sweep again: nothing left.
    assert_eq!(wallet.debit_batch(100).await.unwrap(), 0);
    assert_eq!(fx.wallet_balance().await, -600);
}
