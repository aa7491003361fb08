//! The gateway webhook endpoint. No bearer/admin auth: the signature is the
//! authentication.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use meterline_shared::error::ServiceError;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(dispatcher) = &state.dispatcher else {
        return Err(ServiceError::unavailable("webhook secret not configured").into());
    };
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::auth("missing Stripe-Signature header"))?;

    dispatcher.dispatch(&body, signature).await?;
    Ok(Json(json!({"received": true})))
}
