//! Health, capabilities and the event-schema catalog.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use meterline_shared::error::ServiceError;
use meterline_shared::schema;
use meterline_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "store": "ok"})),
        ),
        Err(err) => {
            tracing::error!(error = %err, "store ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "store": "unreachable"})),
            )
        }
    }
}

pub async fn capabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authenticate(&headers).await?;
    let schemas = schema::built_in();
    Ok(Json(json!({
        "apiVersion": "v1",
        "usageIngestion": {
            "maxBatchSize": state.config.max_batch_size,
            "supportedEventTypes": schemas.iter().map(|s| s.event_type).collect::<Vec<_>>(),
        },
        "meters": schema::meter_keys(),
    })))
}

pub async fn list_schemas(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authenticate(&headers).await?;
    Ok(Json(json!({ "schemas": schema::built_in() })))
}

pub async fn get_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_type): Path<String>,
) -> Result<Json<schema::EventSchema>, ApiError> {
    state.authenticate(&headers).await?;
    let found = schema::find(&event_type)
        .ok_or_else(|| ServiceError::not_found("unknown event type"))?;
    Ok(Json(found))
}
