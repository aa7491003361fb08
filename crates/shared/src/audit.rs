//! Append-only audit trail for admin mutations and exports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AuditLogId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: AuditLogId,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

impl AuditLog {
    pub fn new(
        action: &str,
        entity_type: &str,
        entity_id: impl ToString,
        actor: &str,
        at: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            id: AuditLogId::new(),
            action: action.to_owned(),
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_string(),
            actor: actor.to_owned(),
            at,
            payload,
        }
    }
}
