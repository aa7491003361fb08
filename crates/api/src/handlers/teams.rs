//! Team lifecycle, membership, entitlements and the wallet surface.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use meterline_shared::catalog::WalletConfig;
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, BillToId, ExternalTeamId, TeamId, UserId};
use meterline_shared::tenant::{
    BillingEntity, BillingMode, ExternalTeamRef, MemberRole, MemberStatus, Team, TeamKind,
    TeamMember,
};
use meterline_store::{AppStore, CatalogStore, TeamStore};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTeamRequest {
    pub external_team_id: ExternalTeamId,
    pub name: String,
    #[serde(default)]
    pub kind: Option<TeamKind>,
    #[serde(default)]
    pub billing_mode: Option<BillingMode>,
    #[serde(default)]
    pub owner_user_id: Option<UserId>,
    #[serde(default)]
    pub default_currency: Option<String>,
}

/// Create-or-fetch keyed by the caller's external team id.
pub async fn create_team(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
    Json(request): Json<CreateTeamRequest>,
) -> Result<Json<Team>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    if request.external_team_id.as_str().is_empty() {
        return Err(ServiceError::validation("externalTeamId must not be empty").into());
    }
    state
        .store
        .get_app(app_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("app not found"))?;

    let now = state.clock.now();
    let team = Team {
        id: TeamId::new(),
        app_id,
        name: request.name,
        kind: request.kind.unwrap_or(TeamKind::Standard),
        owner_user_id: request.owner_user_id.clone(),
        default_currency: request.default_currency.unwrap_or_else(|| "USD".into()),
        stripe_customer_id: None,
        billing_mode: request.billing_mode.unwrap_or(BillingMode::Subscription),
        created_at: now,
    };
    let entity = BillingEntity {
        id: BillToId::new(),
        team_id: team.id,
    };
    let ext_ref = ExternalTeamRef {
        app_id,
        external_team_id: request.external_team_id,
        team_id: team.id,
    };

    let (team, created) = state.store.create_team(team, entity, ext_ref).await?;
    if created {
        if let Some(owner) = request.owner_user_id {
            state
                .store
                .upsert_member(TeamMember {
                    team_id: team.id,
                    user_id: owner,
                    role: MemberRole::Owner,
                    status: MemberStatus::Active,
                    started_at: now,
                    ended_at: None,
                })
                .await?;
        }
    }
    Ok(Json(team))
}

pub async fn get_team(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
) -> Result<Json<Team>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    let team = load_team(&state, app_id, team_id).await?;
    Ok(Json(team))
}

/// Soft removal; repeat calls return the removed row unchanged.
pub async fn remove_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id, user_id)): Path<(AppId, TeamId, String)>,
) -> Result<Json<TeamMember>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    load_team(&state, app_id, team_id).await?;

    let member = state
        .store
        .remove_member(team_id, &UserId(user_id), state.clock.now())
        .await?
        .ok_or_else(|| ServiceError::not_found("member not found"))?;
    Ok(Json(member))
}

pub async fn entitlements(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
) -> Result<Json<meterline_entitlement::EntitlementResult>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    load_team(&state, app_id, team_id).await?;
    let result = state.entitlements.resolve(app_id, team_id).await?;
    Ok(Json((*result).clone()))
}

pub async fn wallet_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    let team = load_team(&state, app_id, team_id).await?;
    let entity = state
        .store
        .billing_entity_for_team(team_id)
        .await?
        .ok_or_else(|| ServiceError::internal("team has no billing entity"))?;
    let balance = state
        .ledger
        .wallet_balance(app_id, entity.id)
        .await
        .map_err(|e| ServiceError::internal(e.to_string()))?;
    Ok(Json(json!({
        "balanceMinor": balance,
        "currency": team.default_currency,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfigRequest {
    pub auto_top_up_enabled: bool,
    pub threshold_minor: i64,
    pub top_up_amount_minor: i64,
}

pub async fn put_wallet_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
    Json(request): Json<WalletConfigRequest>,
) -> Result<Json<WalletConfig>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    load_team(&state, app_id, team_id).await?;
    if request.threshold_minor < 0 || request.top_up_amount_minor < 0 {
        return Err(ServiceError::validation("amounts must be non-negative").into());
    }

    let config = WalletConfig {
        app_id,
        team_id,
        auto_top_up_enabled: request.auto_top_up_enabled,
        threshold_minor: request.threshold_minor,
        top_up_amount_minor: request.top_up_amount_minor,
    };
    state.store.upsert_wallet_config(config.clone()).await?;
    Ok(Json(config))
}

pub(crate) async fn load_team(
    state: &AppState,
    app_id: AppId,
    team_id: TeamId,
) -> Result<Team, ServiceError> {
    let team = state
        .store
        .get_team(team_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("team not found"))?;
    if team.app_id != app_id {
        return Err(ServiceError::not_found("team not found"));
    }
    Ok(team)
}
