//! Ledger service tests: posting, duplicate detection, balances, and the
//! global-uniqueness invariant under arbitrary key collisions.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use meterline_shared::ids::{AppId, BillToId};
use meterline_shared::ledger::{LedgerAccountType, LedgerEntryType, ReferenceType};
use meterline_shared::FixedClock;
use meterline_store::MemoryStore;

use crate::{CreateEntry, LedgerError, LedgerService};

fn service() -> (LedgerService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let clock = FixedClock::at(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
    (LedgerService::new(store.clone(), Arc::new(clock)), store)
}

fn topup(app_id: AppId, bill_to: BillToId, key: &str, amount: i64) -> CreateEntry {
    CreateEntry {
        app_id,
        bill_to_id: bill_to,
        account_type: LedgerAccountType::Wallet,
        entry_type: LedgerEntryType::Topup,
        amount_minor: amount,
        currency: "USD".into(),
        reference_type: ReferenceType::GatewayEvent,
        reference_id: Some("evt_1".into()),
        idempotency_key: key.into(),
        metadata: json!({}),
    }
}

#[tokio::test]
async fn test_post_and_balance() {
    let (ledger, _) = service();
    let app_id = AppId::new();
    let bill_to = BillToId::new();

    ledger.create_entry(topup(app_id, bill_to, "t1", 5000)).await.unwrap();
    ledger.create_entry(topup(app_id, bill_to, "t2", -3000)).await.unwrap();

    assert_eq!(ledger.wallet_balance(app_id, bill_to).await.unwrap(), 2000);
}

#[tokio::test]
async fn test_duplicate_returns_prior_entry() {
    let (ledger, _) = service();
    let app_id = AppId::new();
    let bill_to = BillToId::new();

    let first = ledger
        .create_entry(topup(app_id, bill_to, "t1", 5000))
        .await
        .unwrap();
    let err = ledger
        .create_entry(topup(app_id, bill_to, "t1", 9999))
        .await
        .unwrap_err();
    match err {
        LedgerError::DuplicateEntry { key, existing } => {
            assert_eq!(key, "t1");
            assert_eq!(existing.id, first.id);
            assert_eq!(existing.amount_minor, 5000);
        }
        other => panic!("unexpected: {other:?}"),
    }
    // The replay wrote nothing.
    assert_eq!(ledger.wallet_balance(app_id, bill_to).await.unwrap(), 5000);
}

#[tokio::test]
async fn test_accounts_collapse_per_type() {
    let (ledger, _) = service();
    let app_id = AppId::new();
    let bill_to = BillToId::new();

    let a = ledger
        .get_or_create_account(app_id, bill_to, LedgerAccountType::Wallet)
        .await
        .unwrap();
    let b = ledger
        .get_or_create_account(app_id, bill_to, LedgerAccountType::Wallet)
        .await
        .unwrap();
    let c = ledger
        .get_or_create_account(app_id, bill_to, LedgerAccountType::AccountsReceivable)
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_ne!(a.id, c.id);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// However keys collide, the number of stored entries equals the number
    /// of distinct keys, and the balance counts each key once.
    #[test]
    fn prop_no_two_entries_share_a_key(keys in proptest::collection::vec(0u8..8, 1..32)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (ledger, store) = service();
            let app_id = AppId::new();
            let bill_to = BillToId::new();

            let mut distinct = std::collections::HashSet::new();
            for k in &keys {
                let key = format!("k{k}");
                let fresh = distinct.insert(key.clone());
                let result = ledger.create_entry(topup(app_id, bill_to, &key, 100)).await;
                prop_assert_eq!(result.is_ok(), fresh);
            }
            prop_assert_eq!(store.ledger_entry_count(), distinct.len());
            prop_assert_eq!(
                ledger.wallet_balance(app_id, bill_to).await.unwrap(),
                distinct.len() as i64 * 100
            );
            Ok(())
        })?;
    }
}
