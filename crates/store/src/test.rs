//! Tests for the in-memory store's transactional semantics. These pin the
//! observable contract both implementations must share: constraint names,
//! idempotent creates, and the ACTIVE-contract predicate.

use chrono::{TimeZone, Utc};
use serde_json::json;

use meterline_shared::agreement::{BillingPeriod, Contract, ContractStatus, PricingMode};
use meterline_shared::ids::{
    AppId, BillToId, BundleId, ContractId, InvoiceId, LedgerAccountId, LedgerEntryId, TeamId,
    UsageEventId,
};
use meterline_shared::invoice::{Invoice, InvoiceStatus};
use meterline_shared::ledger::{LedgerAccountType, LedgerEntry, LedgerEntryType, ReferenceType};
use meterline_shared::tenant::{
    BillingEntity, BillingMode, ExternalTeamRef, JtiRecord, Team, TeamKind,
};
use meterline_shared::usage::UsageEvent;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::traits::*;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
}

fn team_fixture(app_id: AppId) -> (Team, BillingEntity, ExternalTeamRef) {
    let team = Team {
        id: TeamId::new(),
        app_id,
        name: "acme".into(),
        kind: TeamKind::Standard,
        owner_user_id: None,
        default_currency: "USD".into(),
        stripe_customer_id: None,
        billing_mode: BillingMode::Wallet,
        created_at: now(),
    };
    let entity = BillingEntity {
        id: BillToId::new(),
        team_id: team.id,
    };
    let ext_ref = ExternalTeamRef {
        app_id,
        external_team_id: "ext-1".into(),
        team_id: team.id,
    };
    (team, entity, ext_ref)
}

fn event_fixture(app_id: AppId, bill_to: BillToId, key: &str) -> UsageEvent {
    UsageEvent {
        id: UsageEventId::new(),
        app_id,
        team_id: None,
        user_id: None,
        bill_to_id: bill_to,
        event_type: "api.request.v1".into(),
        timestamp: now(),
        idempotency_key: key.into(),
        payload: json!({"count": 1}),
        source: "sdk".into(),
        created_at: now(),
        priced_at: None,
        retry_count: 0,
        next_retry_at: None,
    }
}

fn entry_fixture(account: LedgerAccountId, key: &str, amount: i64) -> LedgerEntry {
    LedgerEntry {
        id: LedgerEntryId::new(),
        app_id: AppId::new(),
        bill_to_id: BillToId::new(),
        ledger_account_id: account,
        entry_type: LedgerEntryType::Topup,
        amount_minor: amount,
        currency: "USD".into(),
        reference_type: ReferenceType::Manual,
        reference_id: None,
        idempotency_key: key.into(),
        metadata: json!({}),
        timestamp: now(),
    }
}

#[tokio::test]
async fn test_team_create_is_idempotent_on_external_ref() {
    let store = MemoryStore::new();
    let app_id = AppId::new();
    let (team, entity, ext_ref) = team_fixture(app_id);

    let (first, created) = store
        .create_team(team.clone(), entity, ext_ref.clone())
        .await
        .unwrap();
    assert!(created);

    let (dup_team, dup_entity, _) = team_fixture(app_id);
    let ext_ref_again = ExternalTeamRef {
        team_id: dup_team.id,
        ..ext_ref
    };
    let (second, created) = store
        .create_team(dup_team, dup_entity, ext_ref_again)
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn test_jti_insert_rejects_replay() {
    let store = MemoryStore::new();
    let record = JtiRecord {
        jti: "abc".into(),
        expires_at: now(),
    };
    store.insert_jti(record.clone()).await.unwrap();
    let err = store.insert_jti(record).await.unwrap_err();
    assert!(err.is_unique_violation());
}

#[tokio::test]
async fn test_event_dedup_counts_duplicates() {
    let store = MemoryStore::new();
    let app_id = AppId::new();
    let bill_to = BillToId::new();

    let outcome = store
        .insert_events(vec![event_fixture(app_id, bill_to, "k1")])
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome { accepted: 1, duplicates: 0 });

    let outcome = store
        .insert_events(vec![
            event_fixture(app_id, bill_to, "k1"),
            event_fixture(app_id, bill_to, "k2"),
        ])
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome { accepted: 1, duplicates: 1 });

    // Same key under another app is a distinct event.
    let outcome = store
        .insert_events(vec![event_fixture(AppId::new(), bill_to, "k1")])
        .await
        .unwrap();
    assert_eq!(outcome.accepted, 1);
}

#[tokio::test]
async fn test_ledger_idempotency_key_is_global() {
    let store = MemoryStore::new();
    let account = store
        .get_or_create_account(AppId::new(), BillToId::new(), LedgerAccountType::Wallet, now())
        .await
        .unwrap();
    let other = store
        .get_or_create_account(AppId::new(), BillToId::new(), LedgerAccountType::Wallet, now())
        .await
        .unwrap();

    store
        .insert_entry(entry_fixture(account.id, "topup:1", 500))
        .await
        .unwrap();
    // Same key on a different tenant's account still collides.
    let err = store
        .insert_entry(entry_fixture(other.id, "topup:1", 500))
        .await
        .unwrap_err();
    match err {
        StoreError::UniqueViolation { constraint } => {
            assert_eq!(constraint, "ledger_entries.idempotency_key")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_account_balance_as_of_filter() {
    let store = MemoryStore::new();
    let account = store
        .get_or_create_account(AppId::new(), BillToId::new(), LedgerAccountType::Wallet, now())
        .await
        .unwrap();

    let mut early = entry_fixture(account.id, "a", 1000);
    early.timestamp = now() - chrono::Duration::days(2);
    let late = entry_fixture(account.id, "b", -300);
    store.insert_entry(early).await.unwrap();
    store.insert_entry(late).await.unwrap();

    assert_eq!(store.account_balance(account.id, None).await.unwrap(), 700);
    assert_eq!(
        store
            .account_balance(account.id, Some(now() - chrono::Duration::days(1)))
            .await
            .unwrap(),
        1000
    );
}

fn contract_fixture(bill_to: BillToId, status: ContractStatus) -> Contract {
    Contract {
        id: ContractId::new(),
        bill_to_id: bill_to,
        bundle_id: BundleId::new(),
        currency: "USD".into(),
        billing_period: BillingPeriod::Monthly,
        terms_days: 30,
        pricing_mode: PricingMode::FixedPlusTrueup,
        starts_at: now(),
        ends_at: None,
        status,
        created_at: now(),
    }
}

#[tokio::test]
async fn test_at_most_one_active_contract_per_bill_to() {
    let store = MemoryStore::new();
    let bill_to = BillToId::new();

    store
        .insert_contract(contract_fixture(bill_to, ContractStatus::Active))
        .await
        .unwrap();
    let err = store
        .insert_contract(contract_fixture(bill_to, ContractStatus::Active))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(ref c) if c == "active-contract-exists"));

    // DRAFT is fine, activating it is not.
    let draft = contract_fixture(bill_to, ContractStatus::Draft);
    store.insert_contract(draft.clone()).await.unwrap();
    let err = store
        .update_contract_status(draft.id, ContractStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn test_mark_invoice_paid_transitions_once() {
    let store = MemoryStore::new();
    let invoice = Invoice {
        id: InvoiceId::new(),
        contract_id: ContractId::new(),
        bill_to_id: BillToId::new(),
        period_start: now(),
        period_end: now(),
        status: InvoiceStatus::Issued,
        subtotal_minor: 300,
        tax_minor: 0,
        total_minor: 300,
        issued_at: Some(now()),
        due_at: None,
        created_at: now(),
    };
    store
        .create_invoice_with_lines(invoice.clone(), vec![])
        .await
        .unwrap();

    let account = store
        .get_or_create_account(AppId::new(), invoice.bill_to_id, LedgerAccountType::AccountsReceivable, now())
        .await
        .unwrap();
    let entry = entry_fixture(account.id, &format!("invoice-paid:{}", invoice.id), 300);

    let (paid, changed) = store
        .mark_invoice_paid(invoice.id, entry.clone())
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(paid.status, InvoiceStatus::Paid);

    // Second call is the idempotent no-op.
    let (paid, changed) = store.mark_invoice_paid(invoice.id, entry).await.unwrap();
    assert!(!changed);
    assert_eq!(paid.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_stripe_customer_id_single_writer() {
    let store = MemoryStore::new();
    let app_id = AppId::new();
    let (team, entity, ext_ref) = team_fixture(app_id);
    store.create_team(team.clone(), entity, ext_ref).await.unwrap();

    assert!(store
        .set_stripe_customer_id_if_absent(team.id, "cus_A")
        .await
        .unwrap());
    assert!(!store
        .set_stripe_customer_id_if_absent(team.id, "cus_B")
        .await
        .unwrap());
    let stored = store.get_team(team.id).await.unwrap().unwrap();
    assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_A"));
}
