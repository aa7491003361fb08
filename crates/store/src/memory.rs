//! In-memory store.
//!
//! A single mutex over the whole state gives every trait method, including
//! the multi-row transactional ones, trivial atomicity. This is the backing
//! store for tests and for running without `DATABASE_URL`; it intentionally
//! mirrors the Postgres implementation's observable behavior, constraint
//! names included.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use meterline_shared::agreement::{
    Bundle, BundleApp, BundleMeterPolicy, Contract, ContractOverride, ContractStatus,
};
use meterline_shared::audit::AuditLog;
use meterline_shared::catalog::{
    Addon, Plan, PriceBook, PriceBookKind, PriceRule, StripeProductMap, WalletConfig,
};
use meterline_shared::ids::{
    AddonId, AppId, BillToId, BundleId, ContractId, InvoiceId, Kid, LedgerAccountId, LineItemId,
    PlanId, PriceBookId, SubscriptionId, TeamId, UsageEventId, UserId,
};
use meterline_shared::invoice::{Invoice, InvoiceLineItem, InvoiceStatus};
use meterline_shared::ledger::{LedgerAccount, LedgerAccountType, LedgerEntry};
use meterline_shared::subscription::TeamSubscription;
use meterline_shared::tenant::{
    App, AppSecret, BillingEntity, ExternalTeamRef, JtiRecord, MemberStatus, SecretStatus, Team,
    TeamMember,
};
use meterline_shared::usage::{BillableLineItem, UsageEvent};

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    AppStore, AuditStore, CatalogStore, ContractStore, IngestOutcome, InvoiceStore, JtiStore,
    LedgerStore, Store, SubscriptionStore, TeamStore, UsageStore,
};

#[derive(Default)]
struct MemState {
    apps: HashMap<AppId, App>,
    secrets: HashMap<Kid, AppSecret>,
    jtis: HashMap<String, JtiRecord>,

    teams: HashMap<TeamId, Team>,
    billing_entities: HashMap<BillToId, BillingEntity>,
    ext_refs: HashMap<(AppId, String), ExternalTeamRef>,
    members: HashMap<(TeamId, String), TeamMember>,

    plans: HashMap<PlanId, Plan>,
    addons: HashMap<AddonId, Addon>,
    product_maps: Vec<StripeProductMap>,
    price_books: HashMap<PriceBookId, PriceBook>,
    price_rules: Vec<PriceRule>,
    wallet_configs: HashMap<(AppId, TeamId), WalletConfig>,

    events: HashMap<UsageEventId, UsageEvent>,
    event_keys: HashSet<(AppId, String)>,
    line_items: HashMap<LineItemId, BillableLineItem>,

    accounts: HashMap<(AppId, BillToId, LedgerAccountType), LedgerAccount>,
    ledger_entries: Vec<LedgerEntry>,
    ledger_keys: HashSet<String>,

    bundles: HashMap<BundleId, Bundle>,
    bundle_codes: HashSet<String>,
    bundle_apps: Vec<BundleApp>,
    bundle_policies: Vec<BundleMeterPolicy>,
    contracts: HashMap<ContractId, Contract>,
    overrides: Vec<ContractOverride>,

    subscriptions: HashMap<SubscriptionId, TeamSubscription>,

    invoices: HashMap<InvoiceId, Invoice>,
    invoice_lines: Vec<InvoiceLineItem>,

    audits: Vec<AuditLog>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        // A poisoned lock means a panic mid-write; tests want the panic, not
        // a hang.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(any(test, feature = "testutils"))]
impl MemoryStore {
    /// Drops a ledger entry, simulating partial-failure damage for
    /// repair-path tests.
    pub fn remove_ledger_entry(&self, idempotency_key: &str) -> bool {
        let mut st = self.lock();
        let before = st.ledger_entries.len();
        st.ledger_entries
            .retain(|e| e.idempotency_key != idempotency_key);
        let removed = st.ledger_entries.len() < before;
        if removed {
            st.ledger_keys.remove(idempotency_key);
        }
        removed
    }

    pub fn ledger_entry_count(&self) -> usize {
        self.lock().ledger_entries.len()
    }
}

// ── Apps & secrets ────────────────────────────────────────────────────────────

#[async_trait]
impl AppStore for MemoryStore {
    async fn insert_app(&self, app: App) -> StoreResult<()> {
        let mut st = self.lock();
        if st.apps.contains_key(&app.id) {
            return Err(StoreError::unique("apps.id"));
        }
        st.apps.insert(app.id, app);
        Ok(())
    }

    async fn get_app(&self, id: AppId) -> StoreResult<Option<App>> {
        Ok(self.lock().apps.get(&id).cloned())
    }

    async fn insert_secret(&self, secret: AppSecret) -> StoreResult<()> {
        let mut st = self.lock();
        if st.secrets.contains_key(&secret.kid) {
            return Err(StoreError::unique("app_secrets.kid"));
        }
        st.secrets.insert(secret.kid.clone(), secret);
        Ok(())
    }

    async fn get_secret_by_kid(&self, kid: &Kid) -> StoreResult<Option<AppSecret>> {
        Ok(self.lock().secrets.get(kid).cloned())
    }

    async fn revoke_secret(
        &self,
        app_id: AppId,
        kid: &Kid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<AppSecret>> {
        let mut st = self.lock();
        let Some(secret) = st.secrets.get_mut(kid) else {
            return Ok(None);
        };
        if secret.app_id != app_id {
            return Ok(None);
        }
        if secret.status == SecretStatus::Active {
            secret.status = SecretStatus::Revoked;
            secret.revoked_at = Some(at);
        }
        Ok(Some(secret.clone()))
    }
}

#[async_trait]
impl JtiStore for MemoryStore {
    async fn insert_jti(&self, record: JtiRecord) -> StoreResult<()> {
        let mut st = self.lock();
        if st.jtis.contains_key(&record.jti) {
            return Err(StoreError::unique("jti_records.jti"));
        }
        st.jtis.insert(record.jti.clone(), record);
        Ok(())
    }

    async fn delete_expired_jtis(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut st = self.lock();
        let before = st.jtis.len();
        st.jtis.retain(|_, r| r.expires_at > now);
        Ok((before - st.jtis.len()) as u64)
    }
}

// ── Teams ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl TeamStore for MemoryStore {
    async fn create_team(
        &self,
        team: Team,
        entity: BillingEntity,
        ext_ref: ExternalTeamRef,
    ) -> StoreResult<(Team, bool)> {
        let mut st = self.lock();
        let ref_key = (ext_ref.app_id, ext_ref.external_team_id.0.clone());
        if let Some(existing) = st.ext_refs.get(&ref_key) {
            let team = st
                .teams
                .get(&existing.team_id)
                .cloned()
                .ok_or(StoreError::RowNotFound("teams"))?;
            return Ok((team, false));
        }
        st.ext_refs.insert(ref_key, ext_ref);
        st.billing_entities.insert(entity.id, entity);
        st.teams.insert(team.id, team.clone());
        Ok((team, true))
    }

    async fn get_team(&self, id: TeamId) -> StoreResult<Option<Team>> {
        Ok(self.lock().teams.get(&id).cloned())
    }

    async fn billing_entity_for_team(
        &self,
        team_id: TeamId,
    ) -> StoreResult<Option<BillingEntity>> {
        Ok(self
            .lock()
            .billing_entities
            .values()
            .find(|e| e.team_id == team_id)
            .cloned())
    }

    async fn team_for_bill_to(&self, bill_to: BillToId) -> StoreResult<Option<Team>> {
        let st = self.lock();
        let Some(entity) = st.billing_entities.get(&bill_to) else {
            return Ok(None);
        };
        Ok(st.teams.get(&entity.team_id).cloned())
    }

    async fn upsert_member(&self, member: TeamMember) -> StoreResult<TeamMember> {
        let mut st = self.lock();
        let key = (member.team_id, member.user_id.0.clone());
        let entry = st.members.entry(key).or_insert_with(|| member.clone());
        Ok(entry.clone())
    }

    async fn get_member(
        &self,
        team_id: TeamId,
        user_id: &UserId,
    ) -> StoreResult<Option<TeamMember>> {
        Ok(self
            .lock()
            .members
            .get(&(team_id, user_id.0.clone()))
            .cloned())
    }

    async fn remove_member(
        &self,
        team_id: TeamId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<TeamMember>> {
        let mut st = self.lock();
        let Some(member) = st.members.get_mut(&(team_id, user_id.0.clone())) else {
            return Ok(None);
        };
        if member.status == MemberStatus::Active {
            member.status = MemberStatus::Removed;
            member.ended_at = Some(at);
        }
        Ok(Some(member.clone()))
    }

    async fn set_stripe_customer_id_if_absent(
        &self,
        team_id: TeamId,
        customer_id: &str,
    ) -> StoreResult<bool> {
        let mut st = self.lock();
        let team = st
            .teams
            .get_mut(&team_id)
            .ok_or(StoreError::RowNotFound("teams"))?;
        if team.stripe_customer_id.is_some() {
            return Ok(false);
        }
        team.stripe_customer_id = Some(customer_id.to_owned());
        Ok(true)
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_plan(&self, plan: Plan) -> StoreResult<()> {
        let mut st = self.lock();
        if st
            .plans
            .values()
            .any(|p| p.app_id == plan.app_id && p.code == plan.code)
        {
            return Err(StoreError::unique("plans.app_code"));
        }
        st.plans.insert(plan.id, plan);
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<Plan>> {
        Ok(self.lock().plans.get(&id).cloned())
    }

    async fn get_plan_by_code(&self, app_id: AppId, code: &str) -> StoreResult<Option<Plan>> {
        Ok(self
            .lock()
            .plans
            .values()
            .find(|p| p.app_id == app_id && p.code == code)
            .cloned())
    }

    async fn insert_addon(&self, addon: Addon) -> StoreResult<()> {
        let mut st = self.lock();
        if st
            .addons
            .values()
            .any(|a| a.app_id == addon.app_id && a.code == addon.code)
        {
            return Err(StoreError::unique("addons.app_code"));
        }
        st.addons.insert(addon.id, addon);
        Ok(())
    }

    async fn insert_product_map(&self, map: StripeProductMap) -> StoreResult<()> {
        self.lock().product_maps.push(map);
        Ok(())
    }

    async fn product_maps_for_plan(&self, plan_id: PlanId) -> StoreResult<Vec<StripeProductMap>> {
        Ok(self
            .lock()
            .product_maps
            .iter()
            .filter(|m| m.plan_id == Some(plan_id))
            .cloned()
            .collect())
    }

    async fn insert_price_book(&self, book: PriceBook) -> StoreResult<()> {
        self.lock().price_books.insert(book.id, book);
        Ok(())
    }

    async fn get_price_book(&self, id: PriceBookId) -> StoreResult<Option<PriceBook>> {
        Ok(self.lock().price_books.get(&id).cloned())
    }

    async fn price_books_effective(
        &self,
        app_id: AppId,
        kind: PriceBookKind,
        as_of: DateTime<Utc>,
    ) -> StoreResult<Vec<PriceBook>> {
        let mut books: Vec<PriceBook> = self
            .lock()
            .price_books
            .values()
            .filter(|b| b.app_id == app_id && b.kind == kind && b.effective_from <= as_of)
            .cloned()
            .collect();
        books.sort_by(|a, b| b.effective_from.cmp(&a.effective_from));
        Ok(books)
    }

    async fn has_price_book(&self, app_id: AppId, kind: PriceBookKind) -> StoreResult<bool> {
        Ok(self
            .lock()
            .price_books
            .values()
            .any(|b| b.app_id == app_id && b.kind == kind))
    }

    async fn insert_price_rule(&self, rule: PriceRule) -> StoreResult<()> {
        self.lock().price_rules.push(rule);
        Ok(())
    }

    async fn rules_for_book(&self, book_id: PriceBookId) -> StoreResult<Vec<PriceRule>> {
        Ok(self
            .lock()
            .price_rules
            .iter()
            .filter(|r| r.price_book_id == book_id)
            .cloned()
            .collect())
    }

    async fn get_wallet_config(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> StoreResult<Option<WalletConfig>> {
        Ok(self.lock().wallet_configs.get(&(app_id, team_id)).cloned())
    }

    async fn upsert_wallet_config(&self, config: WalletConfig) -> StoreResult<()> {
        self.lock()
            .wallet_configs
            .insert((config.app_id, config.team_id), config);
        Ok(())
    }
}

// ── Usage ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_events(&self, events: Vec<UsageEvent>) -> StoreResult<IngestOutcome> {
        let mut st = self.lock();
        let mut outcome = IngestOutcome::default();
        for event in events {
            let key = (event.app_id, event.idempotency_key.clone());
            if st.event_keys.contains(&key) {
                outcome.duplicates += 1;
                continue;
            }
            st.event_keys.insert(key);
            st.events.insert(event.id, event);
            outcome.accepted += 1;
        }
        Ok(outcome)
    }

    async fn get_event(&self, id: UsageEventId) -> StoreResult<Option<UsageEvent>> {
        Ok(self.lock().events.get(&id).cloned())
    }

    async fn due_unpriced_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<UsageEvent>> {
        let mut due: Vec<UsageEvent> = self
            .lock()
            .events
            .values()
            .filter(|e| {
                e.priced_at.is_none() && e.next_retry_at.map(|t| t <= now).unwrap_or(true)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_event_priced(&self, id: UsageEventId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut st = self.lock();
        let event = st
            .events
            .get_mut(&id)
            .ok_or(StoreError::RowNotFound("usage_events"))?;
        event.priced_at = Some(at);
        Ok(())
    }

    async fn record_pricing_failure(
        &self,
        id: UsageEventId,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        let event = st
            .events
            .get_mut(&id)
            .ok_or(StoreError::RowNotFound("usage_events"))?;
        event.retry_count = retry_count;
        event.next_retry_at = next_retry_at;
        Ok(())
    }

    async fn commit_pricing(
        &self,
        event_id: UsageEventId,
        items: Vec<BillableLineItem>,
        priced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        let event = st
            .events
            .get_mut(&event_id)
            .ok_or(StoreError::RowNotFound("usage_events"))?;
        event.priced_at = Some(priced_at);
        for item in items {
            st.line_items.insert(item.id, item);
        }
        Ok(())
    }

    async fn line_items_for_event(
        &self,
        event_id: UsageEventId,
    ) -> StoreResult<Vec<BillableLineItem>> {
        Ok(self
            .lock()
            .line_items
            .values()
            .filter(|i| i.usage_event_id == Some(event_id))
            .cloned()
            .collect())
    }

    async fn get_line_item(&self, id: LineItemId) -> StoreResult<Option<BillableLineItem>> {
        Ok(self.lock().line_items.get(&id).cloned())
    }

    async fn set_wallet_debited(
        &self,
        ids: &[LineItemId],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        for id in ids {
            if let Some(item) = st.line_items.get_mut(id) {
                item.wallet_debited_at = Some(at);
            }
        }
        Ok(())
    }

    async fn undebited_line_items(&self, limit: usize) -> StoreResult<Vec<BillableLineItem>> {
        let mut items: Vec<BillableLineItem> = self
            .lock()
            .line_items
            .values()
            .filter(|i| i.wallet_debited_at.is_none())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        items.truncate(limit);
        Ok(items)
    }

    async fn line_items_in_period(
        &self,
        bill_to: BillToId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<BillableLineItem>> {
        Ok(self
            .lock()
            .line_items
            .values()
            .filter(|i| i.bill_to_id == bill_to && i.timestamp >= from && i.timestamp < to)
            .cloned()
            .collect())
    }

    async fn line_items_for_team(
        &self,
        team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<BillableLineItem>> {
        Ok(self
            .lock()
            .line_items
            .values()
            .filter(|i| i.team_id == team_id && i.timestamp >= from && i.timestamp < to)
            .cloned()
            .collect())
    }
}

// ── Ledger ────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_or_create_account(
        &self,
        app_id: AppId,
        bill_to: BillToId,
        account_type: LedgerAccountType,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerAccount> {
        let mut st = self.lock();
        let account = st
            .accounts
            .entry((app_id, bill_to, account_type))
            .or_insert_with(|| LedgerAccount {
                id: LedgerAccountId::new(),
                app_id,
                bill_to_id: bill_to,
                account_type,
                created_at: now,
            });
        Ok(account.clone())
    }

    async fn insert_entry(&self, entry: LedgerEntry) -> StoreResult<()> {
        let mut st = self.lock();
        if st.ledger_keys.contains(&entry.idempotency_key) {
            return Err(StoreError::unique("ledger_entries.idempotency_key"));
        }
        st.ledger_keys.insert(entry.idempotency_key.clone());
        st.ledger_entries.push(entry);
        Ok(())
    }

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger_entries
            .iter()
            .find(|e| e.idempotency_key == key)
            .cloned())
    }

    async fn account_balance(
        &self,
        account_id: LedgerAccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        Ok(self
            .lock()
            .ledger_entries
            .iter()
            .filter(|e| e.ledger_account_id == account_id)
            .filter(|e| as_of.map(|t| e.timestamp <= t).unwrap_or(true))
            .map(|e| e.amount_minor)
            .sum())
    }

    async fn entries_for_account(
        &self,
        account_id: LedgerAccountId,
    ) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger_entries
            .iter()
            .filter(|e| e.ledger_account_id == account_id)
            .cloned()
            .collect())
    }

    async fn entries_by_reference(&self, reference_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger_entries
            .iter()
            .filter(|e| e.reference_id.as_deref() == Some(reference_id))
            .cloned()
            .collect())
    }
}

// ── Bundles & contracts ───────────────────────────────────────────────────────

#[async_trait]
impl ContractStore for MemoryStore {
    async fn insert_bundle(&self, bundle: Bundle) -> StoreResult<()> {
        let mut st = self.lock();
        if st.bundle_codes.contains(&bundle.code) {
            return Err(StoreError::unique("bundles.code"));
        }
        st.bundle_codes.insert(bundle.code.clone());
        st.bundles.insert(bundle.id, bundle);
        Ok(())
    }

    async fn get_bundle(&self, id: BundleId) -> StoreResult<Option<Bundle>> {
        Ok(self.lock().bundles.get(&id).cloned())
    }

    async fn update_bundle(&self, bundle: Bundle) -> StoreResult<()> {
        let mut st = self.lock();
        let Some(existing) = st.bundles.get(&bundle.id).cloned() else {
            return Err(StoreError::RowNotFound("bundles"));
        };
        if existing.code != bundle.code {
            if st.bundle_codes.contains(&bundle.code) {
                return Err(StoreError::unique("bundles.code"));
            }
            st.bundle_codes.remove(&existing.code);
            st.bundle_codes.insert(bundle.code.clone());
        }
        st.bundles.insert(bundle.id, bundle);
        Ok(())
    }

    async fn upsert_bundle_app(&self, entry: BundleApp) -> StoreResult<()> {
        let mut st = self.lock();
        st.bundle_apps
            .retain(|e| !(e.bundle_id == entry.bundle_id && e.app_id == entry.app_id));
        st.bundle_apps.push(entry);
        Ok(())
    }

    async fn upsert_bundle_meter_policy(&self, entry: BundleMeterPolicy) -> StoreResult<()> {
        let mut st = self.lock();
        st.bundle_policies.retain(|e| {
            !(e.bundle_id == entry.bundle_id
                && e.app_id == entry.app_id
                && e.meter_key == entry.meter_key)
        });
        st.bundle_policies.push(entry);
        Ok(())
    }

    async fn bundle_apps(&self, bundle_id: BundleId) -> StoreResult<Vec<BundleApp>> {
        Ok(self
            .lock()
            .bundle_apps
            .iter()
            .filter(|e| e.bundle_id == bundle_id)
            .cloned()
            .collect())
    }

    async fn bundle_meter_policies(
        &self,
        bundle_id: BundleId,
    ) -> StoreResult<Vec<BundleMeterPolicy>> {
        Ok(self
            .lock()
            .bundle_policies
            .iter()
            .filter(|e| e.bundle_id == bundle_id)
            .cloned()
            .collect())
    }

    async fn insert_contract(&self, contract: Contract) -> StoreResult<()> {
        let mut st = self.lock();
        if contract.status == ContractStatus::Active
            && st
                .contracts
                .values()
                .any(|c| c.bill_to_id == contract.bill_to_id && c.status == ContractStatus::Active)
        {
            return Err(StoreError::Conflict("active-contract-exists".into()));
        }
        st.contracts.insert(contract.id, contract);
        Ok(())
    }

    async fn get_contract(&self, id: ContractId) -> StoreResult<Option<Contract>> {
        Ok(self.lock().contracts.get(&id).cloned())
    }

    async fn update_contract_status(
        &self,
        id: ContractId,
        status: ContractStatus,
    ) -> StoreResult<Contract> {
        let mut st = self.lock();
        let Some(current) = st.contracts.get(&id).cloned() else {
            return Err(StoreError::RowNotFound("contracts"));
        };
        if status == ContractStatus::Active
            && st.contracts.values().any(|c| {
                c.id != id && c.bill_to_id == current.bill_to_id && c.status == ContractStatus::Active
            })
        {
            return Err(StoreError::Conflict("active-contract-exists".into()));
        }
        let contract = st.contracts.get_mut(&id).expect("checked above");
        contract.status = status;
        Ok(contract.clone())
    }

    async fn active_contract_for_bill_to(
        &self,
        bill_to: BillToId,
    ) -> StoreResult<Option<Contract>> {
        Ok(self
            .lock()
            .contracts
            .values()
            .find(|c| c.bill_to_id == bill_to && c.status == ContractStatus::Active)
            .cloned())
    }

    async fn active_contracts(&self) -> StoreResult<Vec<Contract>> {
        let mut contracts: Vec<Contract> = self
            .lock()
            .contracts
            .values()
            .filter(|c| c.status == ContractStatus::Active)
            .cloned()
            .collect();
        contracts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(contracts)
    }

    async fn replace_overrides(
        &self,
        contract_id: ContractId,
        overrides: Vec<ContractOverride>,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        st.overrides.retain(|o| o.contract_id != contract_id);
        st.overrides.extend(overrides);
        Ok(())
    }

    async fn overrides_for_contract(
        &self,
        contract_id: ContractId,
    ) -> StoreResult<Vec<ContractOverride>> {
        Ok(self
            .lock()
            .overrides
            .iter()
            .filter(|o| o.contract_id == contract_id)
            .cloned()
            .collect())
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn upsert_subscription(&self, sub: TeamSubscription) -> StoreResult<TeamSubscription> {
        let mut st = self.lock();
        let existing_id = st
            .subscriptions
            .values()
            .find(|s| s.gateway_subscription_id == sub.gateway_subscription_id)
            .map(|s| s.id);
        match existing_id {
            Some(id) => {
                let stored = st.subscriptions.get_mut(&id).expect("indexed above");
                stored.status = sub.status;
                stored.plan_id = sub.plan_id.or(stored.plan_id);
                stored.current_period_start = sub.current_period_start;
                stored.current_period_end = sub.current_period_end;
                stored.seats_quantity = sub.seats_quantity;
                stored.updated_at = sub.updated_at;
                Ok(stored.clone())
            }
            None => {
                st.subscriptions.insert(sub.id, sub.clone());
                Ok(sub)
            }
        }
    }

    async fn get_subscription_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> StoreResult<Option<TeamSubscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.gateway_subscription_id == gateway_id)
            .cloned())
    }

    async fn active_subscription_for_team(
        &self,
        team_id: TeamId,
    ) -> StoreResult<Option<TeamSubscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.team_id == team_id && s.status.is_active())
            .cloned())
    }
}

// ── Invoices ──────────────────────────────────────────────────────────────────

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn get_invoice(&self, id: InvoiceId) -> StoreResult<Option<Invoice>> {
        Ok(self.lock().invoices.get(&id).cloned())
    }

    async fn invoice_for_period(
        &self,
        contract_id: ContractId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<Option<Invoice>> {
        Ok(self
            .lock()
            .invoices
            .values()
            .find(|i| {
                i.contract_id == contract_id
                    && i.period_start == period_start
                    && i.period_end == period_end
            })
            .cloned())
    }

    async fn create_invoice_with_lines(
        &self,
        invoice: Invoice,
        lines: Vec<InvoiceLineItem>,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        if st.invoices.values().any(|i| {
            i.contract_id == invoice.contract_id
                && i.period_start == invoice.period_start
                && i.period_end == invoice.period_end
        }) {
            return Err(StoreError::unique("invoices.contract_period"));
        }
        st.invoices.insert(invoice.id, invoice);
        st.invoice_lines.extend(lines);
        Ok(())
    }

    async fn invoice_lines(&self, invoice_id: InvoiceId) -> StoreResult<Vec<InvoiceLineItem>> {
        let mut lines: Vec<InvoiceLineItem> = self
            .lock()
            .invoice_lines
            .iter()
            .filter(|l| l.invoice_id == invoice_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.position);
        Ok(lines)
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        payment_entry: LedgerEntry,
    ) -> StoreResult<(Invoice, bool)> {
        let mut st = self.lock();
        let Some(invoice) = st.invoices.get(&invoice_id).cloned() else {
            return Err(StoreError::RowNotFound("invoices"));
        };
        match invoice.status {
            InvoiceStatus::Paid => Ok((invoice, false)),
            InvoiceStatus::Issued => {
                if !st.ledger_keys.contains(&payment_entry.idempotency_key) {
                    st.ledger_keys
                        .insert(payment_entry.idempotency_key.clone());
                    st.ledger_entries.push(payment_entry);
                }
                let stored = st.invoices.get_mut(&invoice_id).expect("read above");
                stored.status = InvoiceStatus::Paid;
                Ok((stored.clone(), true))
            }
            InvoiceStatus::Draft => Err(StoreError::Conflict("invoice-not-issued".into())),
        }
    }

    async fn update_invoice_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        let invoice = st
            .invoices
            .get_mut(&invoice_id)
            .ok_or(StoreError::RowNotFound("invoices"))?;
        invoice.status = status;
        Ok(())
    }
}

// ── Audit ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, entry: AuditLog) -> StoreResult<()> {
        self.lock().audits.push(entry);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        drop(self.lock());
        Ok(())
    }
}
