//! Usage ingestion and the aggregation endpoints.

use std::collections::{BTreeMap, HashMap};

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use meterline_auth::VerifiedClaims;
use meterline_shared::catalog::PriceBookKind;
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, PriceBookId, TeamId, UsageEventId};
use meterline_shared::usage::{NewUsageEvent, UsageEvent};
use meterline_store::{CatalogStore, IngestOutcome, TeamStore, UsageStore};

use crate::error::ApiError;
use crate::handlers::teams::load_team;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<NewUsageEvent>,
}

/// Batch ingest with per-event dedup on `(appId, idempotencyKey)`.
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(app_id): Path<AppId>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestOutcome>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    state.bind_app(&claims, app_id)?;

    if request.events.is_empty() {
        return Err(ServiceError::validation("events must not be empty").into());
    }
    if request.events.len() > state.config.max_batch_size {
        return Err(ServiceError::validation(format!(
            "batch exceeds maxBatchSize {}",
            state.config.max_batch_size
        ))
        .into());
    }

    let now = state.clock.now();
    let mut bill_tos: HashMap<TeamId, meterline_shared::ids::BillToId> = HashMap::new();
    let mut rows = Vec::with_capacity(request.events.len());
    for event in request.events {
        if event.idempotency_key.trim().is_empty() {
            return Err(ServiceError::validation("idempotencyKey must not be empty").into());
        }
        let team_id = event
            .team_id
            .or(claims.team_id)
            .ok_or_else(|| ServiceError::validation("event has no teamId and token has none"))?;
        let bill_to = match bill_tos.get(&team_id) {
            Some(bill_to) => *bill_to,
            None => {
                load_team(&state, app_id, team_id).await?;
                let entity = state
                    .store
                    .billing_entity_for_team(team_id)
                    .await?
                    .ok_or_else(|| ServiceError::internal("team has no billing entity"))?;
                bill_tos.insert(team_id, entity.id);
                entity.id
            }
        };
        rows.push(UsageEvent {
            id: UsageEventId::new(),
            app_id,
            team_id: Some(team_id),
            user_id: event.user_id.or_else(|| claims.user_id.clone()),
            bill_to_id: bill_to,
            event_type: event.event_type,
            timestamp: event.timestamp.unwrap_or(now),
            idempotency_key: event.idempotency_key,
            payload: event.payload,
            source: event.source.unwrap_or_else(|| "sdk".into()),
            created_at: now,
            priced_at: None,
            retry_count: 0,
            next_retry_at: None,
        });
    }

    let outcome = state.store.insert_events(rows).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub group_by: Option<String>,
}

/// CUSTOMER-side aggregation; requires the `billing:read` scope.
pub async fn team_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(team_id): Path<TeamId>,
    Query(query): Query<AggregationQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    if !claims.has_scope("billing:read") {
        return Err(ServiceError::forbidden("missing billing:read scope").into());
    }
    aggregate(&state, &claims, team_id, query, PriceBookKind::Customer).await
}

/// Operator-cost aggregation over the same window shape.
pub async fn team_cogs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(team_id): Path<TeamId>,
    Query(query): Query<AggregationQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = state.authenticate(&headers).await?;
    aggregate(&state, &claims, team_id, query, PriceBookKind::Cogs).await
}

async fn aggregate(
    state: &AppState,
    claims: &VerifiedClaims,
    team_id: TeamId,
    query: AggregationQuery,
    kind: PriceBookKind,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Tenant isolation without an appId in the route: the token's app must
    // own the team.
    let team = load_team(state, claims.app_id, team_id).await?;
    if query.to <= query.from {
        return Err(ServiceError::validation("to must be after from").into());
    }

    let group_by = query.group_by.as_deref().unwrap_or("eventType");
    if !matches!(group_by, "eventType" | "appId") {
        return Err(ServiceError::validation("groupBy must be eventType or appId").into());
    }

    let items = state
        .store
        .line_items_for_team(team_id, query.from, query.to)
        .await?;

    let mut kinds: HashMap<PriceBookId, PriceBookKind> = HashMap::new();
    let mut groups: BTreeMap<String, (i64, u64)> = BTreeMap::new();
    for item in items {
        let book_kind = match kinds.get(&item.price_book_id) {
            Some(k) => *k,
            None => {
                let Some(book) = state.store.get_price_book(item.price_book_id).await? else {
                    continue;
                };
                kinds.insert(item.price_book_id, book.kind);
                book.kind
            }
        };
        if book_kind != kind {
            continue;
        }
        let key = match group_by {
            "appId" => item.app_id.to_string(),
            _ => item.snapshot_event_type().to_owned(),
        };
        let entry = groups.entry(key).or_insert((0, 0));
        entry.0 += item.amount_minor;
        entry.1 += 1;
    }

    Ok(Json(json!({
        "teamId": team.id,
        "kind": kind.as_str(),
        "from": query.from,
        "to": query.to,
        "groupBy": group_by,
        "groups": groups
            .into_iter()
            .map(|(key, (total, count))| json!({
                "key": key,
                "totalAmountMinor": total,
                "lineItemCount": count,
            }))
            .collect::<Vec<_>>(),
    })))
}
