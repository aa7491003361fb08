//! Application state: every service wired once at the composition root,
//! read-only afterwards.

use std::sync::Arc;

use axum::http::{header, HeaderMap};

use meterline_auth::{messages, AdminKey, SecretVault, TokenEngine, VerifiedClaims};
use meterline_billing::{
    CheckoutDriver, CheckoutUrls, InvoiceAdminService, PeriodCloseService, SubscriptionHandler,
    WebhookDispatcher, WebhookVerifier,
};
use meterline_entitlement::{ContractAdminService, EntitlementService};
use meterline_ledger::LedgerService;
use meterline_pricing::{PricingEngine, PricingWorker, WalletDebitService, WorkerMetrics};
use meterline_shared::audit::AuditLog;
use meterline_shared::error::ServiceError;
use meterline_shared::ids::AppId;
use meterline_shared::{Clock, Config};
use meterline_store::{AuditStore, Store};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    pub vault: SecretVault,
    pub tokens: Arc<TokenEngine>,
    pub admin_key: AdminKey,
    pub ledger: LedgerService,
    pub entitlements: EntitlementService,
    pub contract_admin: ContractAdminService,
    pub checkout: Arc<CheckoutDriver>,
    pub invoices: InvoiceAdminService,
    pub period_close: Arc<PeriodCloseService>,
    pub wallet: WalletDebitService,
    pub pricing_worker: Arc<PricingWorker>,
    pub dispatcher: Option<Arc<WebhookDispatcher>>,
    pub metrics: Arc<WorkerMetrics>,
}

impl AppState {
    /// Wire the whole service graph over an injected store, clock and
    /// gateway.
    pub fn build(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
        gateway: Arc<dyn meterline_billing::PaymentGateway>,
    ) -> Self {
        let vault = SecretVault::new(config.secrets_encryption_key);
        let tokens = Arc::new(TokenEngine::new(
            store.clone(),
            vault.clone(),
            clock.clone(),
        ));
        let admin_key = AdminKey::new(&config.admin_api_key);
        let ledger = LedgerService::new(store.clone(), clock.clone());
        let entitlements = EntitlementService::new(store.clone());
        let contract_admin =
            ContractAdminService::new(store.clone(), entitlements.clone(), clock.clone());
        let checkout = Arc::new(CheckoutDriver::new(
            store.clone(),
            gateway,
            ledger.clone(),
            CheckoutUrls {
                success_url: config.checkout_success_url.clone(),
                cancel_url: config.checkout_cancel_url.clone(),
                portal_return_url: config.portal_return_url.clone(),
            },
        ));
        let metrics = Arc::new(WorkerMetrics::new());
        let wallet = WalletDebitService::new(
            store.clone(),
            ledger.clone(),
            clock.clone(),
            checkout.clone(),
        );
        let pricing_worker = Arc::new(PricingWorker::new(
            store.clone(),
            PricingEngine::new(store.clone()),
            wallet.clone(),
            clock.clone(),
            metrics.clone(),
            config.pricing_batch_size,
            config.pricing_max_retries,
        ));
        let invoices = InvoiceAdminService::new(store.clone(), ledger.clone(), clock.clone());
        let period_close = Arc::new(PeriodCloseService::new(
            store.clone(),
            ledger.clone(),
            clock.clone(),
        ));
        let dispatcher = config.stripe_webhook_secret.as_ref().map(|secret| {
            Arc::new(WebhookDispatcher::new(
                WebhookVerifier::new(secret, config.webhook_tolerance.as_secs() as i64),
                store.clone(),
                ledger.clone(),
                SubscriptionHandler::new(
                    store.clone(),
                    ledger.clone(),
                    entitlements.clone(),
                    clock.clone(),
                ),
                clock.clone(),
            ))
        });

        Self {
            store,
            clock,
            config,
            vault,
            tokens,
            admin_key,
            ledger,
            entitlements,
            contract_admin,
            checkout,
            invoices,
            period_close,
            wallet,
            pricing_worker,
            dispatcher,
            metrics,
        }
    }

    /// Parse and verify the bearer token, producing bound claims.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<VerifiedClaims, ServiceError> {
        let Some(raw) = headers.get(header::AUTHORIZATION) else {
            return Err(ServiceError::auth(messages::MISSING_AUTH_HEADER));
        };
        let raw = raw
            .to_str()
            .map_err(|_| ServiceError::auth(messages::MALFORMED_AUTH_HEADER))?;
        let Some(token) = raw.strip_prefix("Bearer ") else {
            return Err(ServiceError::auth(messages::MALFORMED_AUTH_HEADER));
        };
        if token.trim().is_empty() {
            return Err(ServiceError::auth(messages::EMPTY_BEARER));
        }
        Ok(self.tokens.verify(token.trim()).await?)
    }

    /// Route-scope invariant: `/v1/apps/:appId/...` requires the token's app.
    pub fn bind_app(&self, claims: &VerifiedClaims, route_app: AppId) -> Result<(), ServiceError> {
        if claims.app_id != route_app {
            return Err(ServiceError::forbidden(messages::ROUTE_APP_MISMATCH));
        }
        Ok(())
    }

    pub fn require_admin(&self, headers: &HeaderMap) -> Result<(), ServiceError> {
        let provided = headers
            .get("x-admin-api-key")
            .and_then(|v| v.to_str().ok());
        self.admin_key.check(provided)
    }

    /// Fire-and-forget audit write for admin mutations.
    pub async fn audit(&self, action: &str, entity_type: &str, entity_id: String, payload: serde_json::Value) {
        let entry = AuditLog::new(action, entity_type, entity_id, "admin", self.clock.now(), payload);
        if let Err(err) = self.store.insert_audit(entry).await {
            tracing::warn!(action, error = %err, "audit write failed");
        }
    }
}
