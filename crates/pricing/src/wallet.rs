//! Wallet-debit service: turns CUSTOMER line items into WALLET ledger debits.
//!
//! Two paths share one idempotency discipline:
//! - `debit_immediate` runs right after pricing commits, one line item at a
//!   time, key `wallet-debit:<lineItemId>`;
//! - `debit_batch` is the periodic sweep for items the immediate path missed,
//!   one aggregated debit per `(app, bill-to)`, key
//!   `wallet-batch:<appId>:<billToId>:<hash of sorted item ids>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use meterline_ledger::{CreateEntry, LedgerError, LedgerService};
use meterline_shared::catalog::PriceBookKind;
use meterline_shared::ids::{AppId, BillToId, LineItemId, TeamId};
use meterline_shared::ledger::{LedgerAccountType, LedgerEntry, LedgerEntryType, ReferenceType};
use meterline_shared::tenant::BillingMode;
use meterline_shared::usage::BillableLineItem;
use meterline_shared::Clock;
use meterline_store::{CatalogStore, Store, StoreError, TeamStore, UsageStore};

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What happened to one immediate-debit attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum DebitOutcome {
    /// A WALLET debit was posted.
    Debited(Box<LedgerEntry>),
    /// The idempotency key already existed; nothing was written.
    Duplicate,
    /// Not applicable: item missing, already debited, non-wallet team, or a
    /// COGS item.
    Skipped,
}

/// Hook into the checkout driver's auto-top-up check. Failures are logged and
/// swallowed by the caller; a missed top-up only delays until the next debit.
#[async_trait]
pub trait AutoTopUp: Send + Sync {
    async fn check_and_trigger(&self, app_id: AppId, team_id: TeamId) -> anyhow::Result<()>;
}

/// Used in tests and in deployments without a payment gateway.
pub struct NoopAutoTopUp;

#[async_trait]
impl AutoTopUp for NoopAutoTopUp {
    async fn check_and_trigger(&self, _app_id: AppId, _team_id: TeamId) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct WalletDebitService {
    store: Arc<dyn Store>,
    ledger: LedgerService,
    clock: Arc<dyn Clock>,
    auto_top_up: Arc<dyn AutoTopUp>,
}

impl WalletDebitService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: LedgerService,
        clock: Arc<dyn Clock>,
        auto_top_up: Arc<dyn AutoTopUp>,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            auto_top_up,
        }
    }

    /// Debit one CUSTOMER line item against the team wallet, immediately
    /// after pricing. Idempotent and a no-op for everything that is not a
    /// wallet-mode CUSTOMER item.
    pub async fn debit_immediate(
        &self,
        line_item_id: LineItemId,
    ) -> Result<DebitOutcome, WalletError> {
        let Some(item) = self.store.get_line_item(line_item_id).await? else {
            return Ok(DebitOutcome::Skipped);
        };
        if item.wallet_debited_at.is_some() {
            return Ok(DebitOutcome::Skipped);
        }

        let Some(team) = self.store.get_team(item.team_id).await? else {
            return Ok(DebitOutcome::Skipped);
        };
        if team.billing_mode != BillingMode::Wallet {
            return Ok(DebitOutcome::Skipped);
        }

        let Some(book) = self.store.get_price_book(item.price_book_id).await? else {
            return Ok(DebitOutcome::Skipped);
        };
        if book.kind != PriceBookKind::Customer {
            return Ok(DebitOutcome::Skipped);
        }

        let result = self
            .ledger
            .create_entry(CreateEntry {
                app_id: item.app_id,
                bill_to_id: item.bill_to_id,
                account_type: LedgerAccountType::Wallet,
                entry_type: LedgerEntryType::UsageCharge,
                amount_minor: -item.amount_minor,
                currency: item.currency.clone(),
                reference_type: ReferenceType::UsageEvent,
                reference_id: item.usage_event_id.map(|id| id.to_string()),
                idempotency_key: format!("wallet-debit:{line_item_id}"),
                metadata: json!({
                    "mode": "immediate",
                    "lineItemId": line_item_id,
                    "description": item.description,
                }),
            })
            .await;

        let outcome = match result {
            Ok(entry) => DebitOutcome::Debited(Box::new(entry)),
            Err(err) if err.is_duplicate() => DebitOutcome::Duplicate,
            Err(err) => return Err(err.into()),
        };

        self.store
            .set_wallet_debited(&[line_item_id], self.clock.now())
            .await?;

        if let Err(err) = self
            .auto_top_up
            .check_and_trigger(item.app_id, item.team_id)
            .await
        {
            tracing::warn!(team = %item.team_id, error = %err, "auto-top-up check failed");
        }

        Ok(outcome)
    }

    /// Periodic sweep for CUSTOMER items that were never debited, e.g. items
    /// priced while a team was temporarily off wallet billing. One aggregated
    /// debit per `(app, bill-to)`.
    pub async fn debit_batch(&self, limit: usize) -> Result<usize, WalletError> {
        let items = self.store.undebited_line_items(limit).await?;
        let mut groups: BTreeMap<(AppId, BillToId), Vec<BillableLineItem>> = BTreeMap::new();

        for item in items {
            let Some(team) = self.store.get_team(item.team_id).await? else {
                continue;
            };
            if team.billing_mode != BillingMode::Wallet {
                continue;
            }
            let Some(book) = self.store.get_price_book(item.price_book_id).await? else {
                continue;
            };
            if book.kind != PriceBookKind::Customer {
                continue;
            }
            groups
                .entry((item.app_id, item.bill_to_id))
                .or_default()
                .push(item);
        }

        let mut debited = 0;
        for ((app_id, bill_to), items) in groups {
            let mut ids: Vec<LineItemId> = items.iter().map(|i| i.id).collect();
            ids.sort();
            let total: i64 = items.iter().map(|i| i.amount_minor).sum();
            let currency = items[0].currency.clone();

            let result = self
                .ledger
                .create_entry(CreateEntry {
                    app_id,
                    bill_to_id: bill_to,
                    account_type: LedgerAccountType::Wallet,
                    entry_type: LedgerEntryType::UsageCharge,
                    amount_minor: -total,
                    currency,
                    reference_type: ReferenceType::LineItem,
                    reference_id: None,
                    idempotency_key: format!(
                        "wallet-batch:{app_id}:{bill_to}:{}",
                        hash_ids(&ids)
                    ),
                    metadata: json!({
                        "mode": "batch",
                        "lineItemIds": ids,
                        "itemCount": ids.len(),
                    }),
                })
                .await;

            match result {
                Ok(_) => debited += ids.len(),
                // The exact same batch already landed; only the debited-at
                // stamps were lost.
                Err(err) if err.is_duplicate() => {}
                Err(err) => return Err(err.into()),
            }
            self.store.set_wallet_debited(&ids, self.clock.now()).await?;
        }

        Ok(debited)
    }
}

fn hash_ids(ids: &[LineItemId]) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.to_string().as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}
