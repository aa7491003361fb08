//! Postgres store.
//!
//! Runtime-checked queries; every enum travels as TEXT in its wire spelling,
//! every JSON field as JSONB. Unique constraints in the schema carry the same
//! names the in-memory store reports, so violation handling is identical
//! against either backend. The ACTIVE-contract predicate is a partial unique
//! index (`"contracts.active_bill_to"`), which makes activation races a
//! constraint violation instead of a scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use meterline_shared::agreement::{
    Bundle, BundleApp, BundleMeterPolicy, Contract, ContractOverride, ContractStatus, MeterPolicy,
};
use meterline_shared::audit::AuditLog;
use meterline_shared::catalog::{
    Addon, Plan, PriceBook, PriceBookKind, PriceRule, StripeProductMap, WalletConfig,
};
use meterline_shared::ids::*;
use meterline_shared::invoice::{Invoice, InvoiceLineItem, InvoiceStatus};
use meterline_shared::ledger::{LedgerAccount, LedgerAccountType, LedgerEntry};
use meterline_shared::subscription::TeamSubscription;
use meterline_shared::tenant::{
    App, AppSecret, BillingEntity, ExternalTeamRef, JtiRecord, Team, TeamMember,
};
use meterline_shared::usage::{BillableLineItem, UsageEvent};

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    AppStore, AuditStore, CatalogStore, ContractStore, IngestOutcome, InvoiceStore, JtiStore,
    LedgerStore, Store, SubscriptionStore, TeamStore, UsageStore,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ── Enum / json plumbing ──────────────────────────────────────────────────────

fn estr<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        other => {
            // Every enum here serializes to a string; anything else is a
            // programmer error caught in tests.
            tracing::error!(?other, "enum did not serialize to a string");
            String::new()
        }
    }
}

fn eparse<T: DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_json::from_value(Value::String(raw.to_owned()))
        .map_err(|e| StoreError::Backend(format!("unknown enum value {raw:?}: {e}")))
}

type Json = sqlx::types::Json<Value>;

// ── Row mappers ───────────────────────────────────────────────────────────────

fn app_row(row: &PgRow) -> StoreResult<App> {
    Ok(App {
        id: AppId(row.try_get("id")?),
        name: row.try_get("name")?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn secret_row(row: &PgRow) -> StoreResult<AppSecret> {
    Ok(AppSecret {
        id: SecretId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        kid: Kid(row.try_get("kid")?),
        encrypted_secret: row.try_get("encrypted_secret")?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn team_row(row: &PgRow) -> StoreResult<Team> {
    Ok(Team {
        id: TeamId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        name: row.try_get("name")?,
        kind: eparse(row.try_get::<&str, _>("kind")?)?,
        owner_user_id: row.try_get::<Option<String>, _>("owner_user_id")?.map(UserId),
        default_currency: row.try_get("default_currency")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        billing_mode: eparse(row.try_get::<&str, _>("billing_mode")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn member_row(row: &PgRow) -> StoreResult<TeamMember> {
    Ok(TeamMember {
        team_id: TeamId(row.try_get("team_id")?),
        user_id: UserId(row.try_get("user_id")?),
        role: eparse(row.try_get::<&str, _>("role")?)?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn plan_row(row: &PgRow) -> StoreResult<Plan> {
    Ok(Plan {
        id: PlanId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        feature_flags: row.try_get::<Json, _>("feature_flags")?.0,
        created_at: row.try_get("created_at")?,
    })
}

fn product_map_row(row: &PgRow) -> StoreResult<StripeProductMap> {
    Ok(StripeProductMap {
        id: ProductMapId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        plan_id: row.try_get::<Option<Uuid>, _>("plan_id")?.map(PlanId),
        addon_id: row.try_get::<Option<Uuid>, _>("addon_id")?.map(AddonId),
        kind: eparse(row.try_get::<&str, _>("kind")?)?,
        stripe_product_id: row.try_get("stripe_product_id")?,
        stripe_price_id: row.try_get("stripe_price_id")?,
    })
}

fn price_book_row(row: &PgRow) -> StoreResult<PriceBook> {
    Ok(PriceBook {
        id: PriceBookId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        kind: eparse(row.try_get::<&str, _>("kind")?)?,
        currency: row.try_get("currency")?,
        effective_from: row.try_get("effective_from")?,
        created_at: row.try_get("created_at")?,
    })
}

fn price_rule_row(row: &PgRow) -> StoreResult<PriceRule> {
    Ok(PriceRule {
        id: PriceRuleId(row.try_get("id")?),
        price_book_id: PriceBookId(row.try_get("price_book_id")?),
        priority: row.try_get("priority")?,
        match_spec: row.try_get::<Json, _>("match_spec")?.0,
        rule_spec: row.try_get::<Json, _>("rule_spec")?.0,
        created_at: row.try_get("created_at")?,
    })
}

fn event_row(row: &PgRow) -> StoreResult<UsageEvent> {
    Ok(UsageEvent {
        id: UsageEventId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        team_id: row.try_get::<Option<Uuid>, _>("team_id")?.map(TeamId),
        user_id: row.try_get::<Option<String>, _>("user_id")?.map(UserId),
        bill_to_id: BillToId(row.try_get("bill_to_id")?),
        event_type: row.try_get("event_type")?,
        timestamp: row.try_get("ts")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get::<Json, _>("payload")?.0,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        priced_at: row.try_get("priced_at")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
    })
}

fn line_item_row(row: &PgRow) -> StoreResult<BillableLineItem> {
    Ok(BillableLineItem {
        id: LineItemId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        bill_to_id: BillToId(row.try_get("bill_to_id")?),
        team_id: TeamId(row.try_get("team_id")?),
        user_id: row.try_get::<Option<String>, _>("user_id")?.map(UserId),
        usage_event_id: row
            .try_get::<Option<Uuid>, _>("usage_event_id")?
            .map(UsageEventId),
        timestamp: row.try_get("ts")?,
        price_book_id: PriceBookId(row.try_get("price_book_id")?),
        price_rule_id: PriceRuleId(row.try_get("price_rule_id")?),
        amount_minor: row.try_get("amount_minor")?,
        currency: row.try_get("currency")?,
        description: row.try_get("description")?,
        inputs_snapshot: row.try_get::<Json, _>("inputs_snapshot")?.0,
        wallet_debited_at: row.try_get("wallet_debited_at")?,
    })
}

fn account_row(row: &PgRow) -> StoreResult<LedgerAccount> {
    Ok(LedgerAccount {
        id: LedgerAccountId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        bill_to_id: BillToId(row.try_get("bill_to_id")?),
        account_type: eparse(row.try_get::<&str, _>("account_type")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: LedgerEntryId(row.try_get("id")?),
        app_id: AppId(row.try_get("app_id")?),
        bill_to_id: BillToId(row.try_get("bill_to_id")?),
        ledger_account_id: LedgerAccountId(row.try_get("ledger_account_id")?),
        entry_type: eparse(row.try_get::<&str, _>("entry_type")?)?,
        amount_minor: row.try_get("amount_minor")?,
        currency: row.try_get("currency")?,
        reference_type: eparse(row.try_get::<&str, _>("reference_type")?)?,
        reference_id: row.try_get("reference_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        metadata: row.try_get::<Json, _>("metadata")?.0,
        timestamp: row.try_get("ts")?,
    })
}

fn bundle_row(row: &PgRow) -> StoreResult<Bundle> {
    Ok(Bundle {
        id: BundleId(row.try_get("id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn meter_policy_of(row: &PgRow) -> StoreResult<MeterPolicy> {
    Ok(MeterPolicy {
        limit_type: eparse(row.try_get::<&str, _>("limit_type")?)?,
        included_amount: row.try_get("included_amount")?,
        enforcement: eparse(row.try_get::<&str, _>("enforcement")?)?,
        overage_billing: eparse(row.try_get::<&str, _>("overage_billing")?)?,
    })
}

fn contract_row(row: &PgRow) -> StoreResult<Contract> {
    Ok(Contract {
        id: ContractId(row.try_get("id")?),
        bill_to_id: BillToId(row.try_get("bill_to_id")?),
        bundle_id: BundleId(row.try_get("bundle_id")?),
        currency: row.try_get("currency")?,
        billing_period: eparse(row.try_get::<&str, _>("billing_period")?)?,
        terms_days: row.try_get("terms_days")?,
        pricing_mode: eparse(row.try_get::<&str, _>("pricing_mode")?)?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_row(row: &PgRow) -> StoreResult<TeamSubscription> {
    Ok(TeamSubscription {
        id: SubscriptionId(row.try_get("id")?),
        team_id: TeamId(row.try_get("team_id")?),
        gateway_subscription_id: row.try_get("gateway_subscription_id")?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        plan_id: row.try_get::<Option<Uuid>, _>("plan_id")?.map(PlanId),
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        seats_quantity: row.try_get("seats_quantity")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn invoice_row(row: &PgRow) -> StoreResult<Invoice> {
    Ok(Invoice {
        id: InvoiceId(row.try_get("id")?),
        contract_id: ContractId(row.try_get("contract_id")?),
        bill_to_id: BillToId(row.try_get("bill_to_id")?),
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        status: eparse(row.try_get::<&str, _>("status")?)?,
        subtotal_minor: row.try_get("subtotal_minor")?,
        tax_minor: row.try_get("tax_minor")?,
        total_minor: row.try_get("total_minor")?,
        issued_at: row.try_get("issued_at")?,
        due_at: row.try_get("due_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn invoice_line_row(row: &PgRow) -> StoreResult<InvoiceLineItem> {
    Ok(InvoiceLineItem {
        id: InvoiceLineId(row.try_get("id")?),
        invoice_id: InvoiceId(row.try_get("invoice_id")?),
        position: row.try_get("position")?,
        app_id: row.try_get::<Option<Uuid>, _>("app_id")?.map(AppId),
        line_type: eparse(row.try_get::<&str, _>("line_type")?)?,
        description: row.try_get("description")?,
        quantity: row.try_get("quantity")?,
        unit_price_minor: row.try_get("unit_price_minor")?,
        amount_minor: row.try_get("amount_minor")?,
        usage_summary: row
            .try_get::<Option<Json>, _>("usage_summary")?
            .map(|j| j.0),
    })
}

async fn insert_entry_in<'e, E>(executor: E, entry: &LedgerEntry) -> StoreResult<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"INSERT INTO ledger_entries
           (id, app_id, bill_to_id, ledger_account_id, entry_type, amount_minor,
            currency, reference_type, reference_id, idempotency_key, metadata, ts)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
           ON CONFLICT ON CONSTRAINT "ledger_entries.idempotency_key" DO NOTHING"#,
    )
    .bind(entry.id.0)
    .bind(entry.app_id.0)
    .bind(entry.bill_to_id.0)
    .bind(entry.ledger_account_id.0)
    .bind(estr(&entry.entry_type))
    .bind(entry.amount_minor)
    .bind(&entry.currency)
    .bind(estr(&entry.reference_type))
    .bind(&entry.reference_id)
    .bind(&entry.idempotency_key)
    .bind(sqlx::types::Json(&entry.metadata))
    .bind(entry.timestamp)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ── Apps & secrets ────────────────────────────────────────────────────────────

#[async_trait]
impl AppStore for PgStore {
    async fn insert_app(&self, app: App) -> StoreResult<()> {
        sqlx::query("INSERT INTO apps (id, name, status, created_at) VALUES ($1, $2, $3, $4)")
            .bind(app.id.0)
            .bind(&app.name)
            .bind(estr(&app.status))
            .bind(app.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_app(&self, id: AppId) -> StoreResult<Option<App>> {
        sqlx::query("SELECT * FROM apps WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| app_row(&row))
            .transpose()
    }

    async fn insert_secret(&self, secret: AppSecret) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO app_secrets
               (id, app_id, kid, encrypted_secret, status, created_at, revoked_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(secret.id.0)
        .bind(secret.app_id.0)
        .bind(&secret.kid.0)
        .bind(&secret.encrypted_secret)
        .bind(estr(&secret.status))
        .bind(secret.created_at)
        .bind(secret.revoked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_secret_by_kid(&self, kid: &Kid) -> StoreResult<Option<AppSecret>> {
        sqlx::query("SELECT * FROM app_secrets WHERE kid = $1")
            .bind(&kid.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| secret_row(&row))
            .transpose()
    }

    async fn revoke_secret(
        &self,
        app_id: AppId,
        kid: &Kid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<AppSecret>> {
        sqlx::query(
            r#"UPDATE app_secrets
               SET status = 'REVOKED', revoked_at = COALESCE(revoked_at, $3)
               WHERE app_id = $1 AND kid = $2
               RETURNING *"#,
        )
        .bind(app_id.0)
        .bind(&kid.0)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| secret_row(&row))
        .transpose()
    }
}

#[async_trait]
impl JtiStore for PgStore {
    async fn insert_jti(&self, record: JtiRecord) -> StoreResult<()> {
        sqlx::query("INSERT INTO jti_records (jti, expires_at) VALUES ($1, $2)")
            .bind(&record.jti)
            .bind(record.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_expired_jtis(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM jti_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ── Teams ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl TeamStore for PgStore {
    async fn create_team(
        &self,
        team: Team,
        entity: BillingEntity,
        ext_ref: ExternalTeamRef,
    ) -> StoreResult<(Team, bool)> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"SELECT t.* FROM external_team_refs r JOIN teams t ON t.id = r.team_id
               WHERE r.app_id = $1 AND r.external_team_id = $2"#,
        )
        .bind(ext_ref.app_id.0)
        .bind(&ext_ref.external_team_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            return Ok((team_row(&row)?, false));
        }

        sqlx::query(
            r#"INSERT INTO teams
               (id, app_id, name, kind, owner_user_id, default_currency,
                stripe_customer_id, billing_mode, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(team.id.0)
        .bind(team.app_id.0)
        .bind(&team.name)
        .bind(estr(&team.kind))
        .bind(team.owner_user_id.as_ref().map(|u| u.0.clone()))
        .bind(&team.default_currency)
        .bind(&team.stripe_customer_id)
        .bind(estr(&team.billing_mode))
        .bind(team.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO billing_entities (id, team_id) VALUES ($1, $2)")
            .bind(entity.id.0)
            .bind(entity.team_id.0)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"INSERT INTO external_team_refs (app_id, external_team_id, team_id)
               VALUES ($1, $2, $3)
               ON CONFLICT ON CONSTRAINT "external_team_refs.app_external" DO NOTHING"#,
        )
        .bind(ext_ref.app_id.0)
        .bind(&ext_ref.external_team_id.0)
        .bind(ext_ref.team_id.0)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            // Lost a concurrent create; drop our rows and return the winner.
            tx.rollback().await?;
            let row = sqlx::query(
                r#"SELECT t.* FROM external_team_refs r JOIN teams t ON t.id = r.team_id
                   WHERE r.app_id = $1 AND r.external_team_id = $2"#,
            )
            .bind(ext_ref.app_id.0)
            .bind(&ext_ref.external_team_id.0)
            .fetch_one(&self.pool)
            .await?;
            return Ok((team_row(&row)?, false));
        }

        tx.commit().await?;
        Ok((team, true))
    }

    async fn get_team(&self, id: TeamId) -> StoreResult<Option<Team>> {
        sqlx::query("SELECT * FROM teams WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| team_row(&row))
            .transpose()
    }

    async fn billing_entity_for_team(
        &self,
        team_id: TeamId,
    ) -> StoreResult<Option<BillingEntity>> {
        let row = sqlx::query("SELECT * FROM billing_entities WHERE team_id = $1")
            .bind(team_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            Ok::<_, StoreError>(BillingEntity {
                id: BillToId(row.try_get("id")?),
                team_id: TeamId(row.try_get("team_id")?),
            })
        })
        .transpose()?)
    }

    async fn team_for_bill_to(&self, bill_to: BillToId) -> StoreResult<Option<Team>> {
        sqlx::query(
            r#"SELECT t.* FROM billing_entities e JOIN teams t ON t.id = e.team_id
               WHERE e.id = $1"#,
        )
        .bind(bill_to.0)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| team_row(&row))
        .transpose()
    }

    async fn upsert_member(&self, member: TeamMember) -> StoreResult<TeamMember> {
        sqlx::query(
            r#"INSERT INTO team_members (team_id, user_id, role, status, started_at, ended_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT ON CONSTRAINT "team_members.team_user" DO NOTHING"#,
        )
        .bind(member.team_id.0)
        .bind(&member.user_id.0)
        .bind(estr(&member.role))
        .bind(estr(&member.status))
        .bind(member.started_at)
        .bind(member.ended_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM team_members WHERE team_id = $1 AND user_id = $2")
            .bind(member.team_id.0)
            .bind(&member.user_id.0)
            .fetch_one(&self.pool)
            .await?;
        member_row(&row)
    }

    async fn get_member(
        &self,
        team_id: TeamId,
        user_id: &UserId,
    ) -> StoreResult<Option<TeamMember>> {
        sqlx::query("SELECT * FROM team_members WHERE team_id = $1 AND user_id = $2")
            .bind(team_id.0)
            .bind(&user_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| member_row(&row))
            .transpose()
    }

    async fn remove_member(
        &self,
        team_id: TeamId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<TeamMember>> {
        sqlx::query(
            r#"UPDATE team_members
               SET status = 'REMOVED', ended_at = COALESCE(ended_at, $3)
               WHERE team_id = $1 AND user_id = $2
               RETURNING *"#,
        )
        .bind(team_id.0)
        .bind(&user_id.0)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| member_row(&row))
        .transpose()
    }

    async fn set_stripe_customer_id_if_absent(
        &self,
        team_id: TeamId,
        customer_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE teams SET stripe_customer_id = $2 WHERE id = $1 AND stripe_customer_id IS NULL",
        )
        .bind(team_id.0)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[async_trait]
impl CatalogStore for PgStore {
    async fn insert_plan(&self, plan: Plan) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO plans (id, app_id, code, name, feature_flags, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(plan.id.0)
        .bind(plan.app_id.0)
        .bind(&plan.code)
        .bind(&plan.name)
        .bind(sqlx::types::Json(&plan.feature_flags))
        .bind(plan.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<Plan>> {
        sqlx::query("SELECT * FROM plans WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| plan_row(&row))
            .transpose()
    }

    async fn get_plan_by_code(&self, app_id: AppId, code: &str) -> StoreResult<Option<Plan>> {
        sqlx::query("SELECT * FROM plans WHERE app_id = $1 AND code = $2")
            .bind(app_id.0)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| plan_row(&row))
            .transpose()
    }

    async fn insert_addon(&self, addon: Addon) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO addons (id, app_id, code, name, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(addon.id.0)
        .bind(addon.app_id.0)
        .bind(&addon.code)
        .bind(&addon.name)
        .bind(addon.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_product_map(&self, map: StripeProductMap) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO product_maps
               (id, app_id, plan_id, addon_id, kind, stripe_product_id, stripe_price_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(map.id.0)
        .bind(map.app_id.0)
        .bind(map.plan_id.map(|p| p.0))
        .bind(map.addon_id.map(|a| a.0))
        .bind(estr(&map.kind))
        .bind(&map.stripe_product_id)
        .bind(&map.stripe_price_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn product_maps_for_plan(&self, plan_id: PlanId) -> StoreResult<Vec<StripeProductMap>> {
        let rows = sqlx::query("SELECT * FROM product_maps WHERE plan_id = $1")
            .bind(plan_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(product_map_row).collect()
    }

    async fn insert_price_book(&self, book: PriceBook) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO price_books (id, app_id, kind, currency, effective_from, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(book.id.0)
        .bind(book.app_id.0)
        .bind(estr(&book.kind))
        .bind(&book.currency)
        .bind(book.effective_from)
        .bind(book.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_price_book(&self, id: PriceBookId) -> StoreResult<Option<PriceBook>> {
        sqlx::query("SELECT * FROM price_books WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| price_book_row(&row))
            .transpose()
    }

    async fn price_books_effective(
        &self,
        app_id: AppId,
        kind: PriceBookKind,
        as_of: DateTime<Utc>,
    ) -> StoreResult<Vec<PriceBook>> {
        let rows = sqlx::query(
            r#"SELECT * FROM price_books
               WHERE app_id = $1 AND kind = $2 AND effective_from <= $3
               ORDER BY effective_from DESC"#,
        )
        .bind(app_id.0)
        .bind(estr(&kind))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_book_row).collect()
    }

    async fn has_price_book(&self, app_id: AppId, kind: PriceBookKind) -> StoreResult<bool> {
        let row =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM price_books WHERE app_id = $1 AND kind = $2) AS present")
                .bind(app_id.0)
                .bind(estr(&kind))
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_price_rule(&self, rule: PriceRule) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO price_rules (id, price_book_id, priority, match_spec, rule_spec, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(rule.id.0)
        .bind(rule.price_book_id.0)
        .bind(rule.priority)
        .bind(sqlx::types::Json(&rule.match_spec))
        .bind(sqlx::types::Json(&rule.rule_spec))
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rules_for_book(&self, book_id: PriceBookId) -> StoreResult<Vec<PriceRule>> {
        let rows = sqlx::query("SELECT * FROM price_rules WHERE price_book_id = $1")
            .bind(book_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(price_rule_row).collect()
    }

    async fn get_wallet_config(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> StoreResult<Option<WalletConfig>> {
        let row = sqlx::query("SELECT * FROM wallet_configs WHERE app_id = $1 AND team_id = $2")
            .bind(app_id.0)
            .bind(team_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| {
                Ok::<_, StoreError>(WalletConfig {
                    app_id: AppId(row.try_get("app_id")?),
                    team_id: TeamId(row.try_get("team_id")?),
                    auto_top_up_enabled: row.try_get("auto_top_up_enabled")?,
                    threshold_minor: row.try_get("threshold_minor")?,
                    top_up_amount_minor: row.try_get("top_up_amount_minor")?,
                })
            })
            .transpose()?)
    }

    async fn upsert_wallet_config(&self, config: WalletConfig) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO wallet_configs
               (app_id, team_id, auto_top_up_enabled, threshold_minor, top_up_amount_minor)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT ON CONSTRAINT "wallet_configs.app_team" DO UPDATE SET
                 auto_top_up_enabled = EXCLUDED.auto_top_up_enabled,
                 threshold_minor = EXCLUDED.threshold_minor,
                 top_up_amount_minor = EXCLUDED.top_up_amount_minor"#,
        )
        .bind(config.app_id.0)
        .bind(config.team_id.0)
        .bind(config.auto_top_up_enabled)
        .bind(config.threshold_minor)
        .bind(config.top_up_amount_minor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── Usage ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl UsageStore for PgStore {
    async fn insert_events(&self, events: Vec<UsageEvent>) -> StoreResult<IngestOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = IngestOutcome::default();
        for event in &events {
            let result = sqlx::query(
                r#"INSERT INTO usage_events
                   (id, app_id, team_id, user_id, bill_to_id, event_type, ts,
                    idempotency_key, payload, source, created_at, priced_at,
                    retry_count, next_retry_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                   ON CONFLICT ON CONSTRAINT "usage_events.app_idempotency" DO NOTHING"#,
            )
            .bind(event.id.0)
            .bind(event.app_id.0)
            .bind(event.team_id.map(|t| t.0))
            .bind(event.user_id.as_ref().map(|u| u.0.clone()))
            .bind(event.bill_to_id.0)
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(&event.idempotency_key)
            .bind(sqlx::types::Json(&event.payload))
            .bind(&event.source)
            .bind(event.created_at)
            .bind(event.priced_at)
            .bind(event.retry_count)
            .bind(event.next_retry_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                outcome.accepted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_event(&self, id: UsageEventId) -> StoreResult<Option<UsageEvent>> {
        sqlx::query("SELECT * FROM usage_events WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| event_row(&row))
            .transpose()
    }

    async fn due_unpriced_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<UsageEvent>> {
        let rows = sqlx::query(
            r#"SELECT * FROM usage_events
               WHERE priced_at IS NULL AND (next_retry_at IS NULL OR next_retry_at <= $1)
               ORDER BY created_at ASC
               LIMIT $2"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_row).collect()
    }

    async fn mark_event_priced(&self, id: UsageEventId, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE usage_events SET priced_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound("usage_events"));
        }
        Ok(())
    }

    async fn record_pricing_failure(
        &self,
        id: UsageEventId,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE usage_events SET retry_count = $2, next_retry_at = $3 WHERE id = $1",
        )
        .bind(id.0)
        .bind(retry_count)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound("usage_events"));
        }
        Ok(())
    }

    async fn commit_pricing(
        &self,
        event_id: UsageEventId,
        items: Vec<BillableLineItem>,
        priced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE usage_events SET priced_at = $2 WHERE id = $1")
            .bind(event_id.0)
            .bind(priced_at)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound("usage_events"));
        }
        for item in &items {
            sqlx::query(
                r#"INSERT INTO line_items
                   (id, app_id, bill_to_id, team_id, user_id, usage_event_id, ts,
                    price_book_id, price_rule_id, amount_minor, currency,
                    description, inputs_snapshot, wallet_debited_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
            )
            .bind(item.id.0)
            .bind(item.app_id.0)
            .bind(item.bill_to_id.0)
            .bind(item.team_id.0)
            .bind(item.user_id.as_ref().map(|u| u.0.clone()))
            .bind(item.usage_event_id.map(|e| e.0))
            .bind(item.timestamp)
            .bind(item.price_book_id.0)
            .bind(item.price_rule_id.0)
            .bind(item.amount_minor)
            .bind(&item.currency)
            .bind(&item.description)
            .bind(sqlx::types::Json(&item.inputs_snapshot))
            .bind(item.wallet_debited_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn line_items_for_event(
        &self,
        event_id: UsageEventId,
    ) -> StoreResult<Vec<BillableLineItem>> {
        let rows = sqlx::query("SELECT * FROM line_items WHERE usage_event_id = $1")
            .bind(event_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(line_item_row).collect()
    }

    async fn get_line_item(&self, id: LineItemId) -> StoreResult<Option<BillableLineItem>> {
        sqlx::query("SELECT * FROM line_items WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| line_item_row(&row))
            .transpose()
    }

    async fn set_wallet_debited(
        &self,
        ids: &[LineItemId],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let raw: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        sqlx::query("UPDATE line_items SET wallet_debited_at = $2 WHERE id = ANY($1)")
            .bind(&raw)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn undebited_line_items(&self, limit: usize) -> StoreResult<Vec<BillableLineItem>> {
        let rows = sqlx::query(
            r#"SELECT * FROM line_items WHERE wallet_debited_at IS NULL
               ORDER BY ts ASC LIMIT $1"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(line_item_row).collect()
    }

    async fn line_items_in_period(
        &self,
        bill_to: BillToId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<BillableLineItem>> {
        let rows = sqlx::query(
            "SELECT * FROM line_items WHERE bill_to_id = $1 AND ts >= $2 AND ts < $3",
        )
        .bind(bill_to.0)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(line_item_row).collect()
    }

    async fn line_items_for_team(
        &self,
        team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<BillableLineItem>> {
        let rows =
            sqlx::query("SELECT * FROM line_items WHERE team_id = $1 AND ts >= $2 AND ts < $3")
                .bind(team_id.0)
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(line_item_row).collect()
    }
}

// ── Ledger ────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for PgStore {
    async fn get_or_create_account(
        &self,
        app_id: AppId,
        bill_to: BillToId,
        account_type: LedgerAccountType,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerAccount> {
        sqlx::query(
            r#"INSERT INTO ledger_accounts (id, app_id, bill_to_id, account_type, created_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT ON CONSTRAINT "ledger_accounts.app_bill_to_type" DO NOTHING"#,
        )
        .bind(Uuid::new_v4())
        .bind(app_id.0)
        .bind(bill_to.0)
        .bind(estr(&account_type))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"SELECT * FROM ledger_accounts
               WHERE app_id = $1 AND bill_to_id = $2 AND account_type = $3"#,
        )
        .bind(app_id.0)
        .bind(bill_to.0)
        .bind(estr(&account_type))
        .fetch_one(&self.pool)
        .await?;
        account_row(&row)
    }

    async fn insert_entry(&self, entry: LedgerEntry) -> StoreResult<()> {
        if insert_entry_in(&self.pool, &entry).await? {
            Ok(())
        } else {
            Err(StoreError::unique("ledger_entries.idempotency_key"))
        }
    }

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        sqlx::query("SELECT * FROM ledger_entries WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| entry_row(&row))
            .transpose()
    }

    async fn account_balance(
        &self,
        account_id: LedgerAccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"SELECT COALESCE(SUM(amount_minor), 0)::BIGINT AS balance
               FROM ledger_entries
               WHERE ledger_account_id = $1 AND ($2::TIMESTAMPTZ IS NULL OR ts <= $2)"#,
        )
        .bind(account_id.0)
        .bind(as_of)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("balance")?)
    }

    async fn entries_for_account(
        &self,
        account_id: LedgerAccountId,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let rows =
            sqlx::query("SELECT * FROM ledger_entries WHERE ledger_account_id = $1 ORDER BY ts")
                .bind(account_id.0)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(entry_row).collect()
    }

    async fn entries_by_reference(&self, reference_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM ledger_entries WHERE reference_id = $1")
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_row).collect()
    }
}

// ── Bundles & contracts ───────────────────────────────────────────────────────

#[async_trait]
impl ContractStore for PgStore {
    async fn insert_bundle(&self, bundle: Bundle) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bundles (id, code, name, status, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(bundle.id.0)
        .bind(&bundle.code)
        .bind(&bundle.name)
        .bind(estr(&bundle.status))
        .bind(bundle.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bundle(&self, id: BundleId) -> StoreResult<Option<Bundle>> {
        sqlx::query("SELECT * FROM bundles WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| bundle_row(&row))
            .transpose()
    }

    async fn update_bundle(&self, bundle: Bundle) -> StoreResult<()> {
        let result = sqlx::query("UPDATE bundles SET code = $2, name = $3, status = $4 WHERE id = $1")
            .bind(bundle.id.0)
            .bind(&bundle.code)
            .bind(&bundle.name)
            .bind(estr(&bundle.status))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound("bundles"));
        }
        Ok(())
    }

    async fn upsert_bundle_app(&self, entry: BundleApp) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO bundle_apps (bundle_id, app_id, default_feature_flags)
               VALUES ($1, $2, $3)
               ON CONFLICT ON CONSTRAINT "bundle_apps.bundle_app" DO UPDATE SET
                 default_feature_flags = EXCLUDED.default_feature_flags"#,
        )
        .bind(entry.bundle_id.0)
        .bind(entry.app_id.0)
        .bind(sqlx::types::Json(&entry.default_feature_flags))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_bundle_meter_policy(&self, entry: BundleMeterPolicy) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO bundle_meter_policies
               (bundle_id, app_id, meter_key, limit_type, included_amount, enforcement, overage_billing)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT ON CONSTRAINT "bundle_meter_policies.bundle_app_meter" DO UPDATE SET
                 limit_type = EXCLUDED.limit_type,
                 included_amount = EXCLUDED.included_amount,
                 enforcement = EXCLUDED.enforcement,
                 overage_billing = EXCLUDED.overage_billing"#,
        )
        .bind(entry.bundle_id.0)
        .bind(entry.app_id.0)
        .bind(&entry.meter_key)
        .bind(estr(&entry.policy.limit_type))
        .bind(entry.policy.included_amount)
        .bind(estr(&entry.policy.enforcement))
        .bind(estr(&entry.policy.overage_billing))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bundle_apps(&self, bundle_id: BundleId) -> StoreResult<Vec<BundleApp>> {
        let rows = sqlx::query("SELECT * FROM bundle_apps WHERE bundle_id = $1")
            .bind(bundle_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BundleApp {
                    bundle_id: BundleId(row.try_get("bundle_id")?),
                    app_id: AppId(row.try_get("app_id")?),
                    default_feature_flags: row.try_get::<Json, _>("default_feature_flags")?.0,
                })
            })
            .collect()
    }

    async fn bundle_meter_policies(
        &self,
        bundle_id: BundleId,
    ) -> StoreResult<Vec<BundleMeterPolicy>> {
        let rows = sqlx::query("SELECT * FROM bundle_meter_policies WHERE bundle_id = $1")
            .bind(bundle_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BundleMeterPolicy {
                    bundle_id: BundleId(row.try_get("bundle_id")?),
                    app_id: AppId(row.try_get("app_id")?),
                    meter_key: row.try_get("meter_key")?,
                    policy: meter_policy_of(row)?,
                })
            })
            .collect()
    }

    async fn insert_contract(&self, contract: Contract) -> StoreResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO contracts
               (id, bill_to_id, bundle_id, currency, billing_period, terms_days,
                pricing_mode, starts_at, ends_at, status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(contract.id.0)
        .bind(contract.bill_to_id.0)
        .bind(contract.bundle_id.0)
        .bind(&contract.currency)
        .bind(estr(&contract.billing_period))
        .bind(contract.terms_days)
        .bind(estr(&contract.pricing_mode))
        .bind(contract.starts_at)
        .bind(contract.ends_at)
        .bind(estr(&contract.status))
        .bind(contract.created_at)
        .execute(&self.pool)
        .await
        .map_err(remap_contract_err)?;
        Ok(())
    }

    async fn get_contract(&self, id: ContractId) -> StoreResult<Option<Contract>> {
        sqlx::query("SELECT * FROM contracts WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| contract_row(&row))
            .transpose()
    }

    async fn update_contract_status(
        &self,
        id: ContractId,
        status: ContractStatus,
    ) -> StoreResult<Contract> {
        let row = sqlx::query("UPDATE contracts SET status = $2 WHERE id = $1 RETURNING *")
            .bind(id.0)
            .bind(estr(&status))
            .fetch_optional(&self.pool)
            .await
            .map_err(remap_contract_err)?;
        match row {
            Some(row) => contract_row(&row),
            None => Err(StoreError::RowNotFound("contracts")),
        }
    }

    async fn active_contract_for_bill_to(
        &self,
        bill_to: BillToId,
    ) -> StoreResult<Option<Contract>> {
        sqlx::query("SELECT * FROM contracts WHERE bill_to_id = $1 AND status = 'ACTIVE'")
            .bind(bill_to.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| contract_row(&row))
            .transpose()
    }

    async fn active_contracts(&self) -> StoreResult<Vec<Contract>> {
        let rows =
            sqlx::query("SELECT * FROM contracts WHERE status = 'ACTIVE' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(contract_row).collect()
    }

    async fn replace_overrides(
        &self,
        contract_id: ContractId,
        overrides: Vec<ContractOverride>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM contract_overrides WHERE contract_id = $1")
            .bind(contract_id.0)
            .execute(&mut *tx)
            .await?;
        for entry in &overrides {
            sqlx::query(
                r#"INSERT INTO contract_overrides
                   (contract_id, app_id, meter_key, limit_type, included_amount,
                    enforcement, overage_billing)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(entry.contract_id.0)
            .bind(entry.app_id.0)
            .bind(&entry.meter_key)
            .bind(estr(&entry.policy.limit_type))
            .bind(entry.policy.included_amount)
            .bind(estr(&entry.policy.enforcement))
            .bind(estr(&entry.policy.overage_billing))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn overrides_for_contract(
        &self,
        contract_id: ContractId,
    ) -> StoreResult<Vec<ContractOverride>> {
        let rows = sqlx::query("SELECT * FROM contract_overrides WHERE contract_id = $1")
            .bind(contract_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ContractOverride {
                    contract_id: ContractId(row.try_get("contract_id")?),
                    app_id: AppId(row.try_get("app_id")?),
                    meter_key: row.try_get("meter_key")?,
                    policy: meter_policy_of(row)?,
                })
            })
            .collect()
    }
}

/// The partial unique index on ACTIVE contracts turns an activation race into
/// a constraint violation; surface it as the conflict callers match on.
fn remap_contract_err(err: sqlx::Error) -> StoreError {
    match StoreError::from(err) {
        StoreError::UniqueViolation { constraint }
            if constraint == "contracts.active_bill_to" =>
        {
            StoreError::Conflict("active-contract-exists".into())
        }
        other => other,
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn upsert_subscription(&self, sub: TeamSubscription) -> StoreResult<TeamSubscription> {
        let row = sqlx::query(
            r#"INSERT INTO subscriptions
               (id, team_id, gateway_subscription_id, status, plan_id,
                current_period_start, current_period_end, seats_quantity,
                created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT ON CONSTRAINT "subscriptions.gateway_id" DO UPDATE SET
                 status = EXCLUDED.status,
                 plan_id = COALESCE(EXCLUDED.plan_id, subscriptions.plan_id),
                 current_period_start = EXCLUDED.current_period_start,
                 current_period_end = EXCLUDED.current_period_end,
                 seats_quantity = EXCLUDED.seats_quantity,
                 updated_at = EXCLUDED.updated_at
               RETURNING *"#,
        )
        .bind(sub.id.0)
        .bind(sub.team_id.0)
        .bind(&sub.gateway_subscription_id)
        .bind(estr(&sub.status))
        .bind(sub.plan_id.map(|p| p.0))
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.seats_quantity)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .fetch_one(&self.pool)
        .await?;
        subscription_row(&row)
    }

    async fn get_subscription_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> StoreResult<Option<TeamSubscription>> {
        sqlx::query("SELECT * FROM subscriptions WHERE gateway_subscription_id = $1")
            .bind(gateway_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| subscription_row(&row))
            .transpose()
    }

    async fn active_subscription_for_team(
        &self,
        team_id: TeamId,
    ) -> StoreResult<Option<TeamSubscription>> {
        sqlx::query(
            r#"SELECT * FROM subscriptions
               WHERE team_id = $1 AND status IN ('ACTIVE', 'TRIALING')
               ORDER BY updated_at DESC LIMIT 1"#,
        )
        .bind(team_id.0)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| subscription_row(&row))
        .transpose()
    }
}

// ── Invoices ──────────────────────────────────────────────────────────────────

#[async_trait]
impl InvoiceStore for PgStore {
    async fn get_invoice(&self, id: InvoiceId) -> StoreResult<Option<Invoice>> {
        sqlx::query("SELECT * FROM invoices WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| invoice_row(&row))
            .transpose()
    }

    async fn invoice_for_period(
        &self,
        contract_id: ContractId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StoreResult<Option<Invoice>> {
        sqlx::query(
            r#"SELECT * FROM invoices
               WHERE contract_id = $1 AND period_start = $2 AND period_end = $3"#,
        )
        .bind(contract_id.0)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| invoice_row(&row))
        .transpose()
    }

    async fn create_invoice_with_lines(
        &self,
        invoice: Invoice,
        lines: Vec<InvoiceLineItem>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO invoices
               (id, contract_id, bill_to_id, period_start, period_end, status,
                subtotal_minor, tax_minor, total_minor, issued_at, due_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(invoice.id.0)
        .bind(invoice.contract_id.0)
        .bind(invoice.bill_to_id.0)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(estr(&invoice.status))
        .bind(invoice.subtotal_minor)
        .bind(invoice.tax_minor)
        .bind(invoice.total_minor)
        .bind(invoice.issued_at)
        .bind(invoice.due_at)
        .bind(invoice.created_at)
        .execute(&mut *tx)
        .await?;

        for line in &lines {
            sqlx::query(
                r#"INSERT INTO invoice_lines
                   (id, invoice_id, position, app_id, line_type, description,
                    quantity, unit_price_minor, amount_minor, usage_summary)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
            )
            .bind(line.id.0)
            .bind(line.invoice_id.0)
            .bind(line.position)
            .bind(line.app_id.map(|a| a.0))
            .bind(estr(&line.line_type))
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price_minor)
            .bind(line.amount_minor)
            .bind(line.usage_summary.as_ref().map(sqlx::types::Json))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn invoice_lines(&self, invoice_id: InvoiceId) -> StoreResult<Vec<InvoiceLineItem>> {
        let rows =
            sqlx::query("SELECT * FROM invoice_lines WHERE invoice_id = $1 ORDER BY position")
                .bind(invoice_id.0)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(invoice_line_row).collect()
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        payment_entry: LedgerEntry,
    ) -> StoreResult<(Invoice, bool)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM invoices WHERE id = $1 FOR UPDATE")
            .bind(invoice_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::RowNotFound("invoices"))?;
        let invoice = invoice_row(&row)?;

        match invoice.status {
            InvoiceStatus::Paid => Ok((invoice, false)),
            InvoiceStatus::Draft => Err(StoreError::Conflict("invoice-not-issued".into())),
            InvoiceStatus::Issued => {
                insert_entry_in(&mut *tx, &payment_entry).await?;
                let row =
                    sqlx::query("UPDATE invoices SET status = 'PAID' WHERE id = $1 RETURNING *")
                        .bind(invoice_id.0)
                        .fetch_one(&mut *tx)
                        .await?;
                let paid = invoice_row(&row)?;
                tx.commit().await?;
                Ok((paid, true))
            }
        }
    }

    async fn update_invoice_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE invoices SET status = $2 WHERE id = $1")
            .bind(invoice_id.0)
            .bind(estr(&status))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound("invoices"));
        }
        Ok(())
    }
}

// ── Audit ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_audit(&self, entry: AuditLog) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO audit_log (id, action, entity_type, entity_id, actor, at, payload)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(entry.id.0)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.actor)
        .bind(entry.at)
        .bind(sqlx::types::Json(&entry.payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
