//! Repository traits, grouped by aggregate.
//!
//! Reads return `Option`; writes that race a unique index return
//! [`StoreError::UniqueViolation`] with a stable constraint name. Methods
//! documented as "transactional" are one atomic unit in both implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use meterline_shared::agreement::{
    Bundle, BundleApp, BundleMeterPolicy, Contract, ContractOverride, ContractStatus,
};
use meterline_shared::audit::AuditLog;
use meterline_shared::catalog::{
    Addon, Plan, PriceBook, PriceBookKind, PriceRule, StripeProductMap, WalletConfig,
};
use meterline_shared::ids::{
    AppId, BillToId, BundleId, ContractId, InvoiceId, Kid, LedgerAccountId, LineItemId, PlanId,
    PriceBookId, TeamId, UsageEventId, UserId,
};
use meterline_shared::invoice::{Invoice, InvoiceLineItem, InvoiceStatus};
use meterline_shared::ledger::{LedgerAccount, LedgerAccountType, LedgerEntry};
use meterline_shared::subscription::TeamSubscription;
use meterline_shared::tenant::{App, AppSecret, BillingEntity, ExternalTeamRef, JtiRecord, Team, TeamMember};
use meterline_shared::usage::{BillableLineItem, UsageEvent};

use crate::error::StoreResult;

// ── Apps & secrets ────────────────────────────────────────────────────────────

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn insert_app(&self, app: App) -> StoreResult<()>;
    async fn get_app(&self, id: AppId) -> StoreResult<Option<App>>;

    /// `kid` is unique across all apps.
    async fn insert_secret(&self, secret: AppSecret) -> StoreResult<()>;
    async fn get_secret_by_kid(&self, kid: &Kid) -> StoreResult<Option<AppSecret>>;

    /// Idempotent: revoking an already-revoked secret returns it unchanged.
    async fn revoke_secret(
        &self,
        app_id: AppId,
        kid: &Kid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<AppSecret>>;
}

#[async_trait]
pub trait JtiStore: Send + Sync {
    /// The unique insert on `jti` is the atomic proof of first token use.
    /// Constraint name: `jti_records.jti`.
    async fn insert_jti(&self, record: JtiRecord) -> StoreResult<()>;

    /// Drops records whose `expires_at` is in the past. Returns rows removed.
    async fn delete_expired_jtis(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

// ── Teams ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TeamStore: Send + Sync {
    /// Transactional, idempotent on `(app_id, external_team_id)`: when the ref
    /// already exists the stored team is returned and `created` is false.
    async fn create_team(
        &self,
        team: Team,
        entity: BillingEntity,
        ext_ref: ExternalTeamRef,
    ) -> StoreResult<(Team, bool)>;

    async fn get_team(&self, id: TeamId) -> StoreResult<Option<Team>>;
    async fn billing_entity_for_team(&self, team_id: TeamId) -> StoreResult<Option<BillingEntity>>;
    async fn team_for_bill_to(&self, bill_to: BillToId) -> StoreResult<Option<Team>>;

    /// Insert-or-return-existing on the `(team_id, user_id)` unique pair.
    async fn upsert_member(&self, member: TeamMember) -> StoreResult<TeamMember>;
    async fn get_member(&self, team_id: TeamId, user_id: &UserId)
        -> StoreResult<Option<TeamMember>>;

    /// Soft removal; already-removed members are returned unchanged.
    async fn remove_member(
        &self,
        team_id: TeamId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<TeamMember>>;

    /// `UPDATE teams SET stripe_customer_id = $2 WHERE id = $1 AND
    /// stripe_customer_id IS NULL`. Returns whether a row was written; the
    /// loser of the race re-reads.
    async fn set_stripe_customer_id_if_absent(
        &self,
        team_id: TeamId,
        customer_id: &str,
    ) -> StoreResult<bool>;
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_plan(&self, plan: Plan) -> StoreResult<()>;
    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<Plan>>;
    async fn get_plan_by_code(&self, app_id: AppId, code: &str) -> StoreResult<Option<Plan>>;
    async fn insert_addon(&self, addon: Addon) -> StoreResult<()>;
    async fn insert_product_map(&self, map: StripeProductMap) -> StoreResult<()>;
    async fn product_maps_for_plan(&self, plan_id: PlanId) -> StoreResult<Vec<StripeProductMap>>;

    async fn insert_price_book(&self, book: PriceBook) -> StoreResult<()>;
    async fn get_price_book(&self, id: PriceBookId) -> StoreResult<Option<PriceBook>>;

    /// Books of `kind` with `effective_from <= as_of`, most recent first.
    async fn price_books_effective(
        &self,
        app_id: AppId,
        kind: PriceBookKind,
        as_of: DateTime<Utc>,
    ) -> StoreResult<Vec<PriceBook>>;

    /// True when the app has no book of this kind at all, effective or not.
    async fn has_price_book(&self, app_id: AppId, kind: PriceBookKind) -> StoreResult<bool>;

    async fn insert_price_rule(&self, rule: PriceRule) -> StoreResult<()>;
    async fn rules_for_book(&self, book_id: PriceBookId) -> StoreResult<Vec<PriceRule>>;

    async fn get_wallet_config(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> StoreResult<Option<WalletConfig>>;
    async fn upsert_wallet_config(&self, config: WalletConfig) -> StoreResult<()>;
}

// ── Usage ─────────────────────────────────────────────────────────────────────

/// Per-batch ingestion result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub accepted: usize,
    pub duplicates: usize,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Transactional batch insert; events whose `(app_id, idempotency_key)`
    /// already exists count as duplicates and are not written.
    async fn insert_events(&self, events: Vec<UsageEvent>) -> StoreResult<IngestOutcome>;

    async fn get_event(&self, id: UsageEventId) -> StoreResult<Option<UsageEvent>>;

    /// Unpriced events due for work: `priced_at IS NULL AND (next_retry_at IS
    /// NULL OR next_retry_at <= now)`, oldest first.
    async fn due_unpriced_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<UsageEvent>>;

    async fn mark_event_priced(&self, id: UsageEventId, at: DateTime<Utc>) -> StoreResult<()>;

    async fn record_pricing_failure(
        &self,
        id: UsageEventId,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Transactional: insert the line items and set `priced_at` together.
    async fn commit_pricing(
        &self,
        event_id: UsageEventId,
        items: Vec<BillableLineItem>,
        priced_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn line_items_for_event(
        &self,
        event_id: UsageEventId,
    ) -> StoreResult<Vec<BillableLineItem>>;
    async fn get_line_item(&self, id: LineItemId) -> StoreResult<Option<BillableLineItem>>;
    async fn set_wallet_debited(
        &self,
        ids: &[LineItemId],
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Line items not yet wallet-debited, oldest first, bounded.
    async fn undebited_line_items(&self, limit: usize) -> StoreResult<Vec<BillableLineItem>>;

    /// All line items for a bill-to inside `[from, to)`.
    async fn line_items_in_period(
        &self,
        bill_to: BillToId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<BillableLineItem>>;

    /// All line items for a team inside `[from, to)`.
    async fn line_items_for_team(
        &self,
        team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<BillableLineItem>>;
}

// ── Ledger ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Lookup-or-insert; concurrent inserts collapse on the
    /// `(app_id, bill_to_id, type)` unique index.
    async fn get_or_create_account(
        &self,
        app_id: AppId,
        bill_to: BillToId,
        account_type: LedgerAccountType,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerAccount>;

    /// Append-only. Constraint name on the globally unique idempotency key:
    /// `ledger_entries.idempotency_key`.
    async fn insert_entry(&self, entry: LedgerEntry) -> StoreResult<()>;

    async fn get_entry_by_idempotency_key(&self, key: &str)
        -> StoreResult<Option<LedgerEntry>>;

    /// Sum of `amount_minor` over the account, filtered by `timestamp <=
    /// as_of` when given.
    async fn account_balance(
        &self,
        account_id: LedgerAccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> StoreResult<i64>;

    async fn entries_for_account(
        &self,
        account_id: LedgerAccountId,
    ) -> StoreResult<Vec<LedgerEntry>>;

    async fn entries_by_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Vec<LedgerEntry>>;
}

// ── Bundles & contracts ───────────────────────────────────────────────────────

#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Constraint name on duplicate code: `bundles.code`.
    async fn insert_bundle(&self, bundle: Bundle) -> StoreResult<()>;
    async fn get_bundle(&self, id: BundleId) -> StoreResult<Option<Bundle>>;
    async fn update_bundle(&self, bundle: Bundle) -> StoreResult<()>;
    async fn upsert_bundle_app(&self, entry: BundleApp) -> StoreResult<()>;
    /// Insert-or-replace on `(bundle_id, app_id, meter_key)`.
    async fn upsert_bundle_meter_policy(&self, entry: BundleMeterPolicy) -> StoreResult<()>;
    async fn bundle_apps(&self, bundle_id: BundleId) -> StoreResult<Vec<BundleApp>>;
    async fn bundle_meter_policies(
        &self,
        bundle_id: BundleId,
    ) -> StoreResult<Vec<BundleMeterPolicy>>;

    /// Transactional. Inserting in ACTIVE status re-checks the
    /// one-ACTIVE-per-bill-to predicate and fails with
    /// `Conflict("active-contract-exists")`.
    async fn insert_contract(&self, contract: Contract) -> StoreResult<()>;
    async fn get_contract(&self, id: ContractId) -> StoreResult<Option<Contract>>;

    /// Transactional status transition; the move to ACTIVE re-scans for a
    /// competing ACTIVE contract inside the same transaction.
    async fn update_contract_status(
        &self,
        id: ContractId,
        status: ContractStatus,
    ) -> StoreResult<Contract>;

    async fn active_contract_for_bill_to(
        &self,
        bill_to: BillToId,
    ) -> StoreResult<Option<Contract>>;
    async fn active_contracts(&self) -> StoreResult<Vec<Contract>>;

    /// Transactional delete-then-insert; an empty list clears all overrides.
    async fn replace_overrides(
        &self,
        contract_id: ContractId,
        overrides: Vec<ContractOverride>,
    ) -> StoreResult<()>;
    async fn overrides_for_contract(
        &self,
        contract_id: ContractId,
    ) -> StoreResult<Vec<ContractOverride>>;
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert-or-update keyed by `gateway_subscription_id`.
    async fn upsert_subscription(&self, sub: TeamSubscription) -> StoreResult<TeamSubscription>;
    async fn get_subscription_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> StoreResult<Option<TeamSubscription>>;
    async fn active_subscription_for_team(
        &self,
        team_id: TeamId,
    ) -> StoreResult<Option<TeamSubscription>>;
}

// ── Invoices ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_invoice(&self, id: InvoiceId) -> StoreResult<Option<Invoice>>;
    async fn invoice_for_period(
        &self,
        contract_id: ContractId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<Option<Invoice>>;

    /// Transactional: invoice plus all its lines, or nothing. Duplicate
    /// `(contract_id, period_start, period_end)` fails with
    /// `invoices.contract_period`.
    async fn create_invoice_with_lines(
        &self,
        invoice: Invoice,
        lines: Vec<InvoiceLineItem>,
    ) -> StoreResult<()>;

    /// Lines in their stable emission order (`position` ascending).
    async fn invoice_lines(&self, invoice_id: InvoiceId) -> StoreResult<Vec<InvoiceLineItem>>;

    /// Transactional ISSUED → PAID together with the INVOICE_PAYMENT ledger
    /// entry. Already-PAID returns `(invoice, false)`; a non-ISSUED,
    /// non-PAID status fails with `Conflict`. A duplicate payment entry (left
    /// by a partial earlier run) is absorbed and the transition still lands.
    async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        payment_entry: LedgerEntry,
    ) -> StoreResult<(Invoice, bool)>;

    async fn update_invoice_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> StoreResult<()>;
}

// ── Audit ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: AuditLog) -> StoreResult<()>;
}

// ── The whole store ───────────────────────────────────────────────────────────

#[async_trait]
pub trait Store:
    AppStore
    + JtiStore
    + TeamStore
    + CatalogStore
    + UsageStore
    + LedgerStore
    + ContractStore
    + SubscriptionStore
    + InvoiceStore
    + AuditStore
{
    /// Liveness probe for /healthz.
    async fn ping(&self) -> StoreResult<()>;
}
