//! Admin surface: tenant provisioning, catalog, price books, bundles,
//! contracts and invoice operations. All routes authenticate with
//! `X-Admin-API-Key`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use meterline_entitlement::{NewBundle, NewContract, OverrideEntry};
use meterline_pricing::{MatchSpec, RuleSpec};
use meterline_shared::agreement::{Bundle, BundleStatus, Contract, ContractStatus, MeterPolicy};
use meterline_shared::catalog::{
    Addon, Plan, PriceBook, PriceBookKind, PriceRule, ProductMapKind, StripeProductMap,
};
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{
    AddonId, AppId, BundleId, ContractId, InvoiceId, Kid, PlanId, PriceBookId, PriceRuleId,
    ProductMapId, SecretId,
};
use meterline_shared::tenant::{App, AppSecret, AppStatus, SecretStatus};
use meterline_store::{AppStore, CatalogStore};

use crate::error::ApiError;
use crate::state::AppState;

// ── Apps & secrets ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
}

pub async fn create_app(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateAppRequest>,
) -> Result<Json<App>, ApiError> {
    state.require_admin(&headers)?;
    if request.name.trim().is_empty() {
        return Err(ServiceError::validation("name must not be empty").into());
    }
    let app = App {
        id: AppId::new(),
        name: request.name,
        status: AppStatus::Active,
        created_at: state.clock.now(),
    };
    state.store.insert_app(app.clone()).await?;
    state
        .audit("app.create", "app", app.id.to_string(), json!({"name": app.name}))
        .await;
    Ok(Json(app))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintedSecret {
    pub kid: Kid,
    /// Hex-encoded plaintext; returned exactly once, never stored.
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

pub async fn mint_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
) -> Result<Json<MintedSecret>, ApiError> {
    state.require_admin(&headers)?;
    state
        .store
        .get_app(app_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("app not found"))?;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    let mut kid_bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut kid_bytes);
    let kid = Kid(format!("K{}", hex::encode(kid_bytes)));

    let encrypted = state
        .vault
        .encrypt(&secret_bytes)
        .map_err(|_| ServiceError::internal("secret encryption failed"))?;
    let now = state.clock.now();
    state
        .store
        .insert_secret(AppSecret {
            id: SecretId::new(),
            app_id,
            kid: kid.clone(),
            encrypted_secret: encrypted,
            status: SecretStatus::Active,
            created_at: now,
            revoked_at: None,
        })
        .await?;
    state
        .audit("secret.create", "app_secret", kid.to_string(), json!({"appId": app_id}))
        .await;

    Ok(Json(MintedSecret {
        kid,
        secret: hex::encode(secret_bytes),
        created_at: now,
    }))
}

/// Idempotent: revoking twice returns the revoked row both times.
pub async fn revoke_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, kid)): Path<(AppId, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_admin(&headers)?;
    let secret = state
        .store
        .revoke_secret(app_id, &Kid(kid), state.clock.now())
        .await?
        .ok_or_else(|| ServiceError::not_found("secret not found"))?;
    state
        .audit("secret.revoke", "app_secret", secret.kid.to_string(), json!({"appId": app_id}))
        .await;
    Ok(Json(json!({
        "kid": secret.kid,
        "status": secret.status,
        "revokedAt": secret.revoked_at,
    })))
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub feature_flags: Value,
}

pub async fn create_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
    Json(request): Json<CreatePlanRequest>,
) -> Result<Json<Plan>, ApiError> {
    state.require_admin(&headers)?;
    let plan = Plan {
        id: PlanId::new(),
        app_id,
        code: request.code,
        name: request.name,
        feature_flags: request.feature_flags,
        created_at: state.clock.now(),
    };
    state.store.insert_plan(plan.clone()).await?;
    Ok(Json(plan))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAddonRequest {
    pub code: String,
    pub name: String,
}

pub async fn create_addon(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
    Json(request): Json<CreateAddonRequest>,
) -> Result<Json<Addon>, ApiError> {
    state.require_admin(&headers)?;
    let addon = Addon {
        id: AddonId::new(),
        app_id,
        code: request.code,
        name: request.name,
        created_at: state.clock.now(),
    };
    state.store.insert_addon(addon.clone()).await?;
    Ok(Json(addon))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductMapRequest {
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    #[serde(default)]
    pub addon_id: Option<AddonId>,
    pub kind: ProductMapKind,
    pub stripe_product_id: String,
    pub stripe_price_id: String,
}

pub async fn create_product_map(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
    Json(request): Json<CreateProductMapRequest>,
) -> Result<Json<StripeProductMap>, ApiError> {
    state.require_admin(&headers)?;
    if request.plan_id.is_none() && request.addon_id.is_none() {
        return Err(ServiceError::validation("planId or addonId is required").into());
    }
    let map = StripeProductMap {
        id: ProductMapId::new(),
        app_id,
        plan_id: request.plan_id,
        addon_id: request.addon_id,
        kind: request.kind,
        stripe_product_id: request.stripe_product_id,
        stripe_price_id: request.stripe_price_id,
    };
    state.store.insert_product_map(map.clone()).await?;
    Ok(Json(map))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePriceBookRequest {
    pub kind: PriceBookKind,
    pub currency: String,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
}

pub async fn create_price_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
    Json(request): Json<CreatePriceBookRequest>,
) -> Result<Json<PriceBook>, ApiError> {
    state.require_admin(&headers)?;
    let now = state.clock.now();
    let book = PriceBook {
        id: PriceBookId::new(),
        app_id,
        kind: request.kind,
        currency: request.currency,
        effective_from: request.effective_from.unwrap_or(now),
        created_at: now,
    };
    state.store.insert_price_book(book.clone()).await?;
    Ok(Json(book))
}

#[derive(Debug, Deserialize)]
pub struct CreatePriceRuleRequest {
    pub priority: i32,
    #[serde(rename = "match")]
    pub match_spec: Value,
    #[serde(rename = "rule")]
    pub rule_spec: Value,
}

pub async fn create_price_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<PriceBookId>,
    Json(request): Json<CreatePriceRuleRequest>,
) -> Result<Json<PriceRule>, ApiError> {
    state.require_admin(&headers)?;
    state
        .store
        .get_price_book(book_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("price book not found"))?;

    // Reject rules the pricing engine would flag as permanent failures.
    MatchSpec::decode(&request.match_spec)
        .map_err(|e| ServiceError::validation(format!("bad match: {e}")))?;
    RuleSpec::decode(&request.rule_spec)
        .map_err(|e| ServiceError::validation(format!("bad rule: {e}")))?;

    let rule = PriceRule {
        id: PriceRuleId::new(),
        price_book_id: book_id,
        priority: request.priority,
        match_spec: request.match_spec,
        rule_spec: request.rule_spec,
        created_at: state.clock.now(),
    };
    state.store.insert_price_rule(rule.clone()).await?;
    Ok(Json(rule))
}

// ── Bundles ───────────────────────────────────────────────────────────────────

pub async fn create_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewBundle>,
) -> Result<Json<Bundle>, ApiError> {
    state.require_admin(&headers)?;
    let bundle = state.contract_admin.create_bundle(request).await?;
    state
        .audit("bundle.create", "bundle", bundle.id.to_string(), json!({"code": bundle.code}))
        .await;
    Ok(Json(bundle))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBundleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<BundleStatus>,
}

pub async fn patch_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bundle_id): Path<BundleId>,
    Json(request): Json<PatchBundleRequest>,
) -> Result<Json<Bundle>, ApiError> {
    state.require_admin(&headers)?;
    let bundle = state
        .contract_admin
        .update_bundle(bundle_id, request.name, request.status)
        .await?;
    Ok(Json(bundle))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleAppRequest {
    #[serde(default)]
    pub default_feature_flags: Value,
}

pub async fn put_bundle_app(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bundle_id, app_id)): Path<(BundleId, AppId)>,
    Json(request): Json<BundleAppRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_admin(&headers)?;
    state
        .contract_admin
        .set_bundle_app(bundle_id, app_id, request.default_feature_flags)
        .await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn put_bundle_meter_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bundle_id, app_id, meter_key)): Path<(BundleId, AppId, String)>,
    Json(policy): Json<MeterPolicy>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_admin(&headers)?;
    state
        .contract_admin
        .set_bundle_meter_policy(bundle_id, app_id, meter_key, policy)
        .await?;
    Ok(Json(json!({"ok": true})))
}

// ── Contracts ─────────────────────────────────────────────────────────────────

pub async fn create_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewContract>,
) -> Result<Json<Contract>, ApiError> {
    state.require_admin(&headers)?;
    let contract = state.contract_admin.create_contract(request).await?;
    state
        .audit(
            "contract.create",
            "contract",
            contract.id.to_string(),
            json!({"billToId": contract.bill_to_id, "status": contract.status}),
        )
        .await;
    Ok(Json(contract))
}

#[derive(Debug, Deserialize)]
pub struct PatchContractRequest {
    pub status: ContractStatus,
}

pub async fn patch_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<ContractId>,
    Json(request): Json<PatchContractRequest>,
) -> Result<Json<Contract>, ApiError> {
    state.require_admin(&headers)?;
    let contract = state
        .contract_admin
        .transition_contract(contract_id, request.status)
        .await?;
    state
        .audit(
            "contract.transition",
            "contract",
            contract.id.to_string(),
            json!({"status": contract.status}),
        )
        .await;
    Ok(Json(contract))
}

pub async fn put_overrides(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<ContractId>,
    Json(entries): Json<Vec<OverrideEntry>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_admin(&headers)?;
    let count = state
        .contract_admin
        .replace_overrides(contract_id, entries)
        .await?;
    Ok(Json(json!({"overrides": count})))
}

// ── Invoices & period close ───────────────────────────────────────────────────

pub async fn mark_invoice_paid(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<InvoiceId>,
) -> Result<Json<meterline_shared::invoice::Invoice>, ApiError> {
    state.require_admin(&headers)?;
    let invoice = state.invoices.mark_paid(invoice_id).await?;
    state
        .audit("invoice.mark-paid", "invoice", invoice.id.to_string(), json!({}))
        .await;
    Ok(Json(invoice))
}

pub async fn export_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<InvoiceId>,
) -> Result<Json<meterline_billing::invoices::InvoiceExport>, ApiError> {
    state.require_admin(&headers)?;
    let export = state.invoices.export(invoice_id, "admin").await?;
    Ok(Json(export))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodCloseRequest {
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

/// Manual trigger for the scheduled close; `asOf` makes runs deterministic.
pub async fn run_period_close(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PeriodCloseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_admin(&headers)?;
    let as_of = request.as_of.unwrap_or_else(|| state.clock.now());
    let outcome = state.period_close.run(as_of).await?;
    Ok(Json(json!({
        "invoiced": outcome.invoiced,
        "skipped": outcome.skipped,
        "failed": outcome.failed,
        "asOf": as_of,
    })))
}
