//! Tenant-side entities: apps, signing secrets, teams, members.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AppId, BillToId, ExternalTeamId, Kid, SecretId, TeamId, UserId};

// ── App ───────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Active,
    Disabled,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Active => "ACTIVE",
            AppStatus::Disabled => "DISABLED",
        }
    }
}

/// Tenant envelope. Owns secrets, catalog, price books and usage events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: AppId,
    pub name: String,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
}

// ── AppSecret ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretStatus {
    Active,
    /// Terminal; a revoked kid never verifies again.
    Revoked,
}

/// An HMAC signing secret, stored encrypted. Multiple ACTIVE secrets per app
/// are allowed so clients can rotate without downtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSecret {
    pub id: SecretId,
    pub app_id: AppId,
    pub kid: Kid,
    /// `iv:tag:cipher` framing produced by the secret vault.
    pub encrypted_secret: String,
    pub status: SecretStatus,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

// ── Replay store ──────────────────────────────────────────────────────────────

/// One row per successfully verified token. The unique insert on `jti` is the
/// atomic proof of first use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JtiRecord {
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

// ── Team ──────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamKind {
    Standard,
    Personal,
}

/// How charges against a team are settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingMode {
    Subscription,
    Wallet,
    Hybrid,
    EnterpriseContract,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Subscription => "SUBSCRIPTION",
            BillingMode::Wallet => "WALLET",
            BillingMode::Hybrid => "HYBRID",
            BillingMode::EnterpriseContract => "ENTERPRISE_CONTRACT",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: TeamId,
    pub app_id: AppId,
    pub name: String,
    pub kind: TeamKind,
    pub owner_user_id: Option<UserId>,
    pub default_currency: String,
    pub stripe_customer_id: Option<String>,
    pub billing_mode: BillingMode,
    pub created_at: DateTime<Utc>,
}

/// Stable addressee for monetary records, 1:1 with a team.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEntity {
    pub id: BillToId,
    pub team_id: TeamId,
}

/// Maps the client app's team identifier onto ours; unique per
/// `(app_id, external_team_id)` so team creation is idempotent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTeamRef {
    pub app_id: AppId,
    pub external_team_id: ExternalTeamId,
    pub team_id: TeamId,
}

// ── Membership ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Active,
    Removed,
}

/// Removal is soft: the row stays with `status = REMOVED` and `ended_at` set,
/// preserving membership history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub team_id: TeamId,
    pub user_id: UserId,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
