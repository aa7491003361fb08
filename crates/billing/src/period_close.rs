//! Contract period close: sweep ACTIVE contracts, invoice the most recent
//! completed period, post the ledger, and repair prior partial runs.
//!
//! The run is safe to repeat with the same `as_of`: the invoice's
//! `(contract, periodStart, periodEnd)` uniqueness makes the second pass a
//! repair pass, and the per-line idempotency keys
//! `period-close:<contractId>:<invoiceId>:<lineIndex>` make ledger posting a
//! no-op where entries already exist.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde_json::json;

use meterline_ledger::{CreateEntry, LedgerError, LedgerService};
use meterline_shared::agreement::{
    BillingPeriod, Contract, ContractOverride, MeterPolicy, PricingMode,
};
use meterline_shared::catalog::PriceBookKind;
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, InvoiceId, InvoiceLineId, PriceBookId};
use meterline_shared::invoice::{Invoice, InvoiceLineItem, InvoiceLineType, InvoiceStatus};
use meterline_shared::ledger::{LedgerAccountType, LedgerEntryType, ReferenceType};
use meterline_shared::usage::BillableLineItem;
use meterline_shared::Clock;
use meterline_store::{CatalogStore, ContractStore, InvoiceStore, Store, UsageStore};

/// Counters for one close run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Contracts that received a new invoice.
    pub invoiced: usize,
    /// Contracts whose invoice already existed; only repaired.
    pub skipped: usize,
    /// Contracts that errored; the rest of the batch still ran.
    pub failed: usize,
}

/// Usage aggregated per `(app, eventType)` over the period.
#[derive(Clone, Debug)]
struct MeterAggregate {
    app_id: AppId,
    event_type: String,
    total_amount_minor: i64,
    event_count: u64,
}

pub struct PeriodCloseService {
    store: Arc<dyn Store>,
    ledger: LedgerService,
    clock: Arc<dyn Clock>,
}

impl PeriodCloseService {
    pub fn new(store: Arc<dyn Store>, ledger: LedgerService, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// One sweep over all ACTIVE contracts. Per-contract failures are logged
    /// and counted without stopping the batch.
    pub async fn run(&self, as_of: DateTime<Utc>) -> Result<RunOutcome, ServiceError> {
        let contracts = self.store.active_contracts().await?;
        let mut outcome = RunOutcome::default();

        for contract in contracts {
            match self.close_contract(&contract, as_of).await {
                Ok(true) => outcome.invoiced += 1,
                Ok(false) => outcome.skipped += 1,
                Err(err) => {
                    outcome.failed += 1;
                    tracing::error!(
                        contract = %contract.id,
                        error = %err,
                        "period close failed for contract"
                    );
                }
            }
        }

        tracing::info!(
            invoiced = outcome.invoiced,
            skipped = outcome.skipped,
            failed = outcome.failed,
            %as_of,
            "period close run complete"
        );
        Ok(outcome)
    }

    /// Returns Ok(true) when a new invoice was created, Ok(false) when an
    /// existing invoice was repaired (or no period has completed yet).
    async fn close_contract(
        &self,
        contract: &Contract,
        as_of: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let Some((period_start, period_end)) =
            completed_period(contract.starts_at, contract.billing_period, as_of)
        else {
            // First period still open; nothing to do.
            return Ok(false);
        };

        if let Some(existing) = self
            .store
            .invoice_for_period(contract.id, period_start, period_end)
            .await?
        {
            self.repair_ledger(contract, &existing).await?;
            return Ok(false);
        }

        let aggregates = self
            .aggregate_usage(contract, period_start, period_end)
            .await?;
        let policies = self.effective_policies(contract).await?;
        let lines = build_lines(contract, &aggregates, &policies);

        let subtotal: i64 = lines.iter().map(|l| l.amount_minor).sum();
        let tax = 0;
        let status = match contract.pricing_mode {
            PricingMode::CustomInvoiceOnly => InvoiceStatus::Draft,
            _ => InvoiceStatus::Issued,
        };
        let now = self.clock.now();
        let invoice = Invoice {
            id: InvoiceId::new(),
            contract_id: contract.id,
            bill_to_id: contract.bill_to_id,
            period_start,
            period_end,
            status,
            subtotal_minor: subtotal,
            tax_minor: tax,
            total_minor: subtotal + tax,
            issued_at: (status == InvoiceStatus::Issued).then_some(now),
            due_at: Some(now + Duration::days(contract.terms_days)),
            created_at: now,
        };

        let lines: Vec<InvoiceLineItem> = lines
            .into_iter()
            .enumerate()
            .map(|(position, line)| InvoiceLineItem {
                id: InvoiceLineId::new(),
                invoice_id: invoice.id,
                position: position as i32,
                ..line
            })
            .collect();

        match self
            .store
            .create_invoice_with_lines(invoice.clone(), lines.clone())
            .await
        {
            Ok(()) => {}
            // A concurrent run won the insert; fall back to repairing theirs.
            Err(err) if err.is_unique_violation() => {
                if let Some(existing) = self
                    .store
                    .invoice_for_period(contract.id, period_start, period_end)
                    .await?
                {
                    self.repair_ledger(contract, &existing).await?;
                }
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        // Ledger posting happens outside the invoice transaction; a crash
        // here is healed by the repair pass on the next run.
        self.post_lines(contract, &invoice, &lines).await?;
        Ok(true)
    }

    /// Re-issue every line's ledger entry with its stable key; duplicates are
    /// the expected case, anything else propagates.
    async fn repair_ledger(
        &self,
        contract: &Contract,
        invoice: &Invoice,
    ) -> Result<(), ServiceError> {
        let lines = self.store.invoice_lines(invoice.id).await?;
        self.post_lines(contract, invoice, &lines).await
    }

    async fn post_lines(
        &self,
        contract: &Contract,
        invoice: &Invoice,
        lines: &[InvoiceLineItem],
    ) -> Result<(), ServiceError> {
        for line in lines {
            let entry_type = match line.line_type {
                InvoiceLineType::BaseFee => LedgerEntryType::SubscriptionCharge,
                _ => LedgerEntryType::UsageCharge,
            };
            let result = self
                .ledger
                .create_entry(CreateEntry {
                    app_id: line.app_id.unwrap_or(AppId(uuid::Uuid::nil())),
                    bill_to_id: contract.bill_to_id,
                    account_type: LedgerAccountType::AccountsReceivable,
                    entry_type,
                    amount_minor: line.amount_minor,
                    currency: contract.currency.clone(),
                    reference_type: ReferenceType::Invoice,
                    reference_id: Some(invoice.id.to_string()),
                    idempotency_key: format!(
                        "period-close:{}:{}:{}",
                        contract.id, invoice.id, line.position
                    ),
                    metadata: json!({
                        "invoiceLineId": line.id,
                        "lineType": line.line_type,
                    }),
                })
                .await;
            match result {
                Ok(_) => {}
                Err(LedgerError::DuplicateEntry { .. }) => {}
                Err(err) => return Err(ServiceError::internal(err.to_string())),
            }
        }
        Ok(())
    }

    /// CUSTOMER-side line items in the period, grouped by (app, eventType).
    async fn aggregate_usage(
        &self,
        contract: &Contract,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeterAggregate>, ServiceError> {
        let items = self
            .store
            .line_items_in_period(contract.bill_to_id, from, to)
            .await?;

        let mut book_kinds: HashMap<PriceBookId, PriceBookKind> = HashMap::new();
        let mut groups: BTreeMap<(AppId, String), MeterAggregate> = BTreeMap::new();
        for item in items {
            let kind = match book_kinds.get(&item.price_book_id) {
                Some(kind) => *kind,
                None => {
                    let Some(book) = self.store.get_price_book(item.price_book_id).await? else {
                        continue;
                    };
                    book_kinds.insert(item.price_book_id, book.kind);
                    book.kind
                }
            };
            if kind != PriceBookKind::Customer {
                continue;
            }
            accumulate(&mut groups, &item);
        }
        Ok(groups.into_values().collect())
    }

    /// Bundle policies with contract overrides applied, keyed by meter; used
    /// for included-amount true-up math.
    async fn effective_policies(
        &self,
        contract: &Contract,
    ) -> Result<HashMap<String, MeterPolicy>, ServiceError> {
        let mut policies: HashMap<String, MeterPolicy> = HashMap::new();
        for entry in self.store.bundle_meter_policies(contract.bundle_id).await? {
            policies.insert(entry.meter_key, entry.policy);
        }
        for ContractOverride {
            meter_key, policy, ..
        } in self.store.overrides_for_contract(contract.id).await?
        {
            policies.insert(meter_key, policy);
        }
        Ok(policies)
    }
}

fn accumulate(groups: &mut BTreeMap<(AppId, String), MeterAggregate>, item: &BillableLineItem) {
    let event_type = item.snapshot_event_type().to_owned();
    let entry = groups
        .entry((item.app_id, event_type.clone()))
        .or_insert_with(|| MeterAggregate {
            app_id: item.app_id,
            event_type,
            total_amount_minor: 0,
            event_count: 0,
        });
    entry.total_amount_minor += item.amount_minor;
    entry.event_count += 1;
}

/// The most recent fully elapsed `[start, end)` period: the latest one with
/// `end <= as_of`. A period ending exactly at `as_of` counts as completed.
pub fn completed_period(
    starts_at: DateTime<Utc>,
    billing_period: BillingPeriod,
    as_of: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let step = Months::new(billing_period.months());
    let mut start = starts_at;
    let mut result = None;
    loop {
        let end = start.checked_add_months(step)?;
        if end > as_of {
            break;
        }
        result = Some((start, end));
        start = end;
    }
    result
}

/// Invoice lines per pricing mode. Detail lines that would double-charge an
/// amount already carried by the BASE_FEE are emitted with amount zero and
/// the real numbers inside `usage_summary`.
fn build_lines(
    contract: &Contract,
    aggregates: &[MeterAggregate],
    policies: &HashMap<String, MeterPolicy>,
) -> Vec<InvoiceLineItem> {
    let total_usage: i64 = aggregates.iter().map(|a| a.total_amount_minor).sum();
    let mut lines: Vec<InvoiceLineItem> = Vec::new();

    let line = |line_type: InvoiceLineType,
                app_id: Option<AppId>,
                description: String,
                amount: i64,
                summary: Option<serde_json::Value>| InvoiceLineItem {
        id: InvoiceLineId::new(),
        invoice_id: InvoiceId(uuid::Uuid::nil()),
        position: 0,
        app_id,
        line_type,
        description,
        quantity: 1,
        unit_price_minor: amount,
        amount_minor: amount,
        usage_summary: summary,
    };

    match contract.pricing_mode {
        PricingMode::Fixed => {
            // The fixed fee amount is not yet modeled on the contract.
            lines.push(line(
                InvoiceLineType::BaseFee,
                None,
                "Contract base fee".into(),
                0,
                None,
            ));
        }
        PricingMode::FixedPlusTrueup => {
            lines.push(line(
                InvoiceLineType::BaseFee,
                None,
                "Contract base fee".into(),
                0,
                None,
            ));
            for aggregate in aggregates {
                let included = policies
                    .get(&aggregate.event_type)
                    .and_then(|p| p.included_amount)
                    .unwrap_or(0);
                if aggregate.total_amount_minor > included {
                    lines.push(line(
                        InvoiceLineType::UsageTrueup,
                        Some(aggregate.app_id),
                        format!("Usage true-up: {}", aggregate.event_type),
                        aggregate.total_amount_minor - included,
                        Some(json!({
                            "eventType": aggregate.event_type,
                            "totalAmountMinor": aggregate.total_amount_minor,
                            "includedAmountMinor": included,
                            "eventCount": aggregate.event_count,
                        })),
                    ));
                }
            }
        }
        PricingMode::MinCommitTrueup => {
            // minCommit is a placeholder 0 until the contract model carries
            // it, so the base fee is the period's usage total.
            let min_commit = 0;
            lines.push(line(
                InvoiceLineType::BaseFee,
                None,
                "Minimum commit".into(),
                total_usage.max(min_commit),
                None,
            ));
            for aggregate in aggregates {
                lines.push(line(
                    InvoiceLineType::UsageTrueup,
                    Some(aggregate.app_id),
                    format!("Usage detail: {}", aggregate.event_type),
                    0,
                    Some(json!({
                        "eventType": aggregate.event_type,
                        "totalAmountMinor": aggregate.total_amount_minor,
                        "eventCount": aggregate.event_count,
                    })),
                ));
            }
        }
        PricingMode::CustomInvoiceOnly => {
            lines.push(line(
                InvoiceLineType::BaseFee,
                None,
                "Custom invoice".into(),
                0,
                None,
            ));
            for aggregate in aggregates {
                lines.push(line(
                    InvoiceLineType::UsageTrueup,
                    Some(aggregate.app_id),
                    format!("Usage: {}", aggregate.event_type),
                    aggregate.total_amount_minor,
                    Some(json!({
                        "eventType": aggregate.event_type,
                        "totalAmountMinor": aggregate.total_amount_minor,
                        "eventCount": aggregate.event_count,
                    })),
                ));
            }
        }
    }

    lines
}
