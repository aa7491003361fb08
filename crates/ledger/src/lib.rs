//! Append-only double-entry ledger service.
//!
//! Every monetary mutation in the system funnels through [`LedgerService::
//! create_entry`]. The globally unique idempotency key is the one and only
//! dedup mechanism: a uniqueness violation surfaces as
//! [`LedgerError::DuplicateEntry`] carrying the prior entry, and each caller
//! decides whether that means "already done, fine" or a real fault. Nothing
//! is retried at this layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use meterline_shared::ids::{AppId, BillToId, LedgerAccountId, LedgerEntryId};
use meterline_shared::ledger::{
    LedgerAccount, LedgerAccountType, LedgerEntry, LedgerEntryType, ReferenceType,
};
use meterline_shared::Clock;
use meterline_store::{LedgerStore, Store, StoreError};

#[cfg(test)]
mod test;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The idempotency key has already been used; `existing` is the entry
    /// that won.
    #[error("duplicate ledger entry for idempotency key {key}")]
    DuplicateEntry {
        key: String,
        existing: Box<LedgerEntry>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LedgerError::DuplicateEntry { .. })
    }
}

/// Inputs for one posting. The amount is signed by the caller: TOPUP/REFUND
/// positive on WALLET, USAGE_CHARGE/SUBSCRIPTION_CHARGE negative on WALLET.
/// This service never flips a sign.
#[derive(Clone, Debug)]
pub struct CreateEntry {
    pub app_id: AppId,
    pub bill_to_id: BillToId,
    pub account_type: LedgerAccountType,
    pub entry_type: LedgerEntryType,
    pub amount_minor: i64,
    pub currency: String,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub idempotency_key: String,
    pub metadata: Value,
}

#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Lookup-or-insert on `(app_id, bill_to_id, type)`; concurrent inserts
    /// collapse on the unique index.
    pub async fn get_or_create_account(
        &self,
        app_id: AppId,
        bill_to: BillToId,
        account_type: LedgerAccountType,
    ) -> Result<LedgerAccount, LedgerError> {
        Ok(self
            .store
            .get_or_create_account(app_id, bill_to, account_type, self.clock.now())
            .await?)
    }

    pub async fn create_entry(&self, input: CreateEntry) -> Result<LedgerEntry, LedgerError> {
        let account = self
            .get_or_create_account(input.app_id, input.bill_to_id, input.account_type)
            .await?;

        let entry = LedgerEntry {
            id: LedgerEntryId::new(),
            app_id: input.app_id,
            bill_to_id: input.bill_to_id,
            ledger_account_id: account.id,
            entry_type: input.entry_type,
            amount_minor: input.amount_minor,
            currency: input.currency,
            reference_type: input.reference_type,
            reference_id: input.reference_id,
            idempotency_key: input.idempotency_key,
            metadata: input.metadata,
            timestamp: self.clock.now(),
        };

        match self.store.insert_entry(entry.clone()).await {
            Ok(()) => {
                tracing::debug!(
                    account = %account.id,
                    amount = entry.amount_minor,
                    key = %entry.idempotency_key,
                    "ledger entry posted"
                );
                Ok(entry)
            }
            Err(err) if err.is_unique_violation() => {
                let existing = self
                    .store
                    .get_entry_by_idempotency_key(&entry.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Backend("duplicate key with no stored entry".into())
                    })?;
                Err(LedgerError::DuplicateEntry {
                    key: entry.idempotency_key,
                    existing: Box::new(existing),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Balance as the sum of signed amounts, optionally as of a timestamp.
    pub async fn balance(
        &self,
        account_id: LedgerAccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<i64, LedgerError> {
        Ok(self.store.account_balance(account_id, as_of).await?)
    }

    /// Convenience: the WALLET balance for a bill-to, zero when the account
    /// does not exist yet.
    pub async fn wallet_balance(
        &self,
        app_id: AppId,
        bill_to: BillToId,
    ) -> Result<i64, LedgerError> {
        let account = self
            .get_or_create_account(app_id, bill_to, LedgerAccountType::Wallet)
            .await?;
        self.balance(account.id, None).await
    }
}
