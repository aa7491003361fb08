//! Static catalog of supported usage-event types.
//!
//! Served by `/v1/schemas/usage-events` and folded into the capabilities
//! document. The catalog is code-defined; apps ingest any of these event
//! types and price them through their own price books.

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: &'static str,
    /// "number" | "string" | "boolean"
    pub kind: &'static str,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSchema {
    pub event_type: &'static str,
    pub description: &'static str,
    /// Meter this event type aggregates under.
    pub meter_key: &'static str,
    pub fields: Vec<FieldSpec>,
}

pub fn built_in() -> Vec<EventSchema> {
    vec![
        EventSchema {
            event_type: "llm.completion.v1",
            description: "One model completion call",
            meter_key: "llm.tokens.v1",
            fields: vec![
                FieldSpec {
                    name: "inputTokens",
                    kind: "number",
                    required: true,
                    description: "Prompt tokens consumed",
                },
                FieldSpec {
                    name: "outputTokens",
                    kind: "number",
                    required: false,
                    description: "Completion tokens produced",
                },
                FieldSpec {
                    name: "model",
                    kind: "string",
                    required: false,
                    description: "Model identifier",
                },
            ],
        },
        EventSchema {
            event_type: "api.request.v1",
            description: "One metered API request",
            meter_key: "api.requests.v1",
            fields: vec![FieldSpec {
                name: "count",
                kind: "number",
                required: true,
                description: "Request count, usually 1",
            }],
        },
        EventSchema {
            event_type: "storage.usage.v1",
            description: "Storage high-water mark sample",
            meter_key: "storage.bytes.v1",
            fields: vec![FieldSpec {
                name: "bytes",
                kind: "number",
                required: true,
                description: "Bytes stored at sample time",
            }],
        },
    ]
}

pub fn find(event_type: &str) -> Option<EventSchema> {
    built_in().into_iter().find(|s| s.event_type == event_type)
}

/// Distinct meter keys, for the capabilities document.
pub fn meter_keys() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = built_in().iter().map(|s| s.meter_key).collect();
    keys.dedup();
    keys
}
