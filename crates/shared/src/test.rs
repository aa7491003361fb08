//! Tests for the shared domain model: wire-format stability of the enums,
//! id round-trips, and the event-schema catalog.

use std::str::FromStr;

use serde_json::json;

use crate::agreement::BillingPeriod;
use crate::ids::TeamId;
use crate::ledger::LedgerAccountType;
use crate::schema;
use crate::subscription::SubscriptionStatus;
use crate::tenant::BillingMode;
use crate::usage::BillableLineItem;

#[test]
fn test_uuid_id_roundtrip() {
    let id = TeamId::new();
    let parsed = TeamId::from_str(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn test_status_enums_use_screaming_snake_wire_form() {
    assert_eq!(
        serde_json::to_value(BillingMode::EnterpriseContract).unwrap(),
        json!("ENTERPRISE_CONTRACT")
    );
    assert_eq!(
        serde_json::to_value(LedgerAccountType::AccountsReceivable).unwrap(),
        json!("ACCOUNTS_RECEIVABLE")
    );
    let parsed: BillingMode = serde_json::from_value(json!("WALLET")).unwrap();
    assert_eq!(parsed, BillingMode::Wallet);
}

#[test]
fn test_billing_period_months() {
    assert_eq!(BillingPeriod::Monthly.months(), 1);
    assert_eq!(BillingPeriod::Quarterly.months(), 3);
}

#[test]
fn test_subscription_status_gateway_mapping() {
    assert_eq!(
        SubscriptionStatus::from_gateway("active"),
        SubscriptionStatus::Active
    );
    assert_eq!(
        SubscriptionStatus::from_gateway("past_due"),
        SubscriptionStatus::PastDue
    );
    // Unknown strings must not fail webhook processing.
    assert_eq!(
        SubscriptionStatus::from_gateway("paused"),
        SubscriptionStatus::Incomplete
    );
}

#[test]
fn test_snapshot_event_type_fallback() {
    let mut item: BillableLineItem = serde_json::from_value(json!({
        "id": uuid::Uuid::new_v4(),
        "appId": uuid::Uuid::new_v4(),
        "billToId": uuid::Uuid::new_v4(),
        "teamId": uuid::Uuid::new_v4(),
        "userId": null,
        "usageEventId": null,
        "timestamp": "2026-01-01T00:00:00Z",
        "priceBookId": uuid::Uuid::new_v4(),
        "priceRuleId": uuid::Uuid::new_v4(),
        "amountMinor": 100,
        "currency": "USD",
        "description": "x",
        "inputsSnapshot": {"eventType": "api.request.v1"},
        "walletDebitedAt": null
    }))
    .unwrap();
    assert_eq!(item.snapshot_event_type(), "api.request.v1");

    item.inputs_snapshot = json!({});
    assert_eq!(item.snapshot_event_type(), "unknown");
}

#[test]
fn test_schema_catalog() {
    assert!(schema::find("llm.completion.v1").is_some());
    assert!(schema::find("nope").is_none());
    assert!(schema::meter_keys().contains(&"llm.tokens.v1"));
}
