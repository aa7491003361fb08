//! Admin invoice operations: mark-paid and export.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use meterline_ledger::LedgerService;
use meterline_shared::audit::AuditLog;
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{InvoiceId, LedgerEntryId};
use meterline_shared::invoice::{Invoice, InvoiceLineItem, InvoiceStatus};
use meterline_shared::ledger::{
    LedgerAccountType, LedgerEntry, LedgerEntryType, ReferenceType,
};
use meterline_shared::Clock;
use meterline_store::{AuditStore, ContractStore, InvoiceStore, Store, StoreError};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceExport {
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
}

#[derive(Clone)]
pub struct InvoiceAdminService {
    store: Arc<dyn Store>,
    ledger: LedgerService,
    clock: Arc<dyn Clock>,
}

impl InvoiceAdminService {
    pub fn new(store: Arc<dyn Store>, ledger: LedgerService, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// ISSUED → PAID, atomically with the single INVOICE_PAYMENT posting.
    /// Already-PAID is an idempotent no-op; DRAFT is a client error. A ledger
    /// failure rolls the transition back (the store operation is one
    /// transaction).
    pub async fn mark_paid(&self, invoice_id: InvoiceId) -> Result<Invoice, ServiceError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("invoice not found"))?;
        if invoice.status == InvoiceStatus::Draft {
            return Err(ServiceError::validation("invoice is not issued"));
        }

        let currency = self
            .store
            .get_contract(invoice.contract_id)
            .await?
            .map(|c| c.currency)
            .unwrap_or_else(|| "USD".into());

        // Resolve the receivable account up front; account creation is
        // idempotent and safe outside the transition transaction.
        let nil_app = meterline_shared::ids::AppId(uuid::Uuid::nil());
        let account = self
            .ledger
            .get_or_create_account(nil_app, invoice.bill_to_id, LedgerAccountType::AccountsReceivable)
            .await
            .map_err(|e| ServiceError::internal(e.to_string()))?;

        let payment_entry = LedgerEntry {
            id: LedgerEntryId::new(),
            app_id: nil_app,
            bill_to_id: invoice.bill_to_id,
            ledger_account_id: account.id,
            entry_type: LedgerEntryType::InvoicePayment,
            // Clears the receivable the close run posted.
            amount_minor: -invoice.total_minor,
            currency,
            reference_type: ReferenceType::Invoice,
            reference_id: None,
            idempotency_key: format!("invoice-paid:{invoice_id}"),
            metadata: json!({ "invoiceId": invoice_id }),
            timestamp: self.clock.now(),
        };

        match self.store.mark_invoice_paid(invoice_id, payment_entry).await {
            Ok((invoice, changed)) => {
                if changed {
                    tracing::info!(invoice = %invoice_id, "invoice marked paid");
                }
                Ok(invoice)
            }
            Err(StoreError::Conflict(_)) => {
                Err(ServiceError::validation("invoice is not issued"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read-only projection of the invoice and its lines; leaves an audit
    /// record of who pulled it.
    pub async fn export(
        &self,
        invoice_id: InvoiceId,
        actor: &str,
    ) -> Result<InvoiceExport, ServiceError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("invoice not found"))?;
        let line_items = self.store.invoice_lines(invoice_id).await?;

        self.store
            .insert_audit(AuditLog::new(
                "invoice.export",
                "invoice",
                invoice_id,
                actor,
                self.clock.now(),
                json!({ "lineCount": line_items.len(), "totalMinor": invoice.total_minor }),
            ))
            .await?;

        Ok(InvoiceExport {
            invoice,
            line_items,
        })
    }
}
