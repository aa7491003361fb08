//! Checkout, top-up and portal session endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use meterline_shared::ids::{AppId, TeamId};

use crate::error::ApiError;
use crate::handlers::teams::load_team;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCheckoutRequest {
    pub plan_code: String,
    #[serde(default)]
    pub seats: i64,
}

pub async fn subscription_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
    Json(request): Json<SubscriptionCheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    load_team(&state, app_id, team_id).await?;

    let session = state
        .checkout
        .create_subscription_checkout(app_id, team_id, &request.plan_code, request.seats)
        .await?;
    Ok(Json(json!({"sessionId": session.id, "url": session.url})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupRequest {
    pub amount_minor: i64,
}

pub async fn topup_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
    Json(request): Json<TopupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    load_team(&state, app_id, team_id).await?;

    let session = state
        .checkout
        .create_topup_checkout(app_id, team_id, request.amount_minor)
        .await?;
    Ok(Json(json!({"sessionId": session.id, "url": session.url})))
}

pub async fn portal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((app_id, team_id)): Path<(AppId, TeamId)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;
    load_team(&state, app_id, team_id).await?;

    let session = state.checkout.create_portal_session(app_id, team_id).await?;
    Ok(Json(json!({"sessionId": session.id, "url": session.url})))
}
