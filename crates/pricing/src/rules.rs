//! Strict decoders and evaluation for price-rule JSON.
//!
//! Rules are stored as opaque JSON in the catalog and decoded here, at the
//! component edge. Anything that does not decode cleanly is a permanent
//! pricing failure for the event that hit it.
//!
//! Supported shapes:
//! - `{"type":"flat","amount":N}`
//! - `{"type":"per_unit","field":F,"unitPrice":P}`
//! - `{"type":"tiered","field":F,"tiers":[{"upTo":N|null,"unitPrice":P},…]}`
//!
//! Amounts are minor currency units. Fractional unit totals round toward +∞
//! so fractional usage never bills below cost.

use serde_json::Value;

/// One decoded rule body.
#[derive(Clone, Debug, PartialEq)]
pub enum RuleSpec {
    Flat {
        amount: i64,
    },
    PerUnit {
        field: String,
        unit_price: f64,
    },
    Tiered {
        field: String,
        tiers: Vec<Tier>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tier {
    /// Cumulative upper bound in units; `None` on the last tier means
    /// unbounded.
    pub up_to: Option<f64>,
    pub unit_price: f64,
}

/// Why a rule or match body was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleDecodeError(pub String);

impl std::fmt::Display for RuleDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl RuleSpec {
    pub fn decode(raw: &Value) -> Result<Self, RuleDecodeError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| RuleDecodeError("rule is not an object".into()))?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RuleDecodeError("rule has no type".into()))?;

        match kind {
            "flat" => {
                let amount = obj
                    .get("amount")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RuleDecodeError("flat rule needs integer amount".into()))?;
                Ok(RuleSpec::Flat { amount })
            }
            "per_unit" => Ok(RuleSpec::PerUnit {
                field: required_str(obj, "field")?,
                unit_price: required_number(obj, "unitPrice")?,
            }),
            "tiered" => {
                let field = required_str(obj, "field")?;
                let raw_tiers = obj
                    .get("tiers")
                    .and_then(Value::as_array)
                    .ok_or_else(|| RuleDecodeError("tiered rule needs tiers array".into()))?;
                if raw_tiers.is_empty() {
                    return Err(RuleDecodeError("tiered rule has no tiers".into()));
                }
                let mut tiers = Vec::with_capacity(raw_tiers.len());
                for (index, tier) in raw_tiers.iter().enumerate() {
                    let tier = tier.as_object().ok_or_else(|| {
                        RuleDecodeError(format!("tier {index} is not an object"))
                    })?;
                    let up_to = match tier.get("upTo") {
                        None | Some(Value::Null) => None,
                        Some(v) => Some(v.as_f64().ok_or_else(|| {
                            RuleDecodeError(format!("tier {index} upTo is not a number"))
                        })?),
                    };
                    let unit_price = tier.get("unitPrice").and_then(Value::as_f64).ok_or_else(
                        || RuleDecodeError(format!("tier {index} unitPrice is not a number")),
                    )?;
                    // Only the last tier may be unbounded.
                    if up_to.is_none() && index + 1 != raw_tiers.len() {
                        return Err(RuleDecodeError(format!(
                            "tier {index} is unbounded but not last"
                        )));
                    }
                    tiers.push(Tier { up_to, unit_price });
                }
                Ok(RuleSpec::Tiered { field, tiers })
            }
            other => Err(RuleDecodeError(format!("unknown rule type {other:?}"))),
        }
    }

    /// Evaluate against an event payload. Returns the amount in minor units
    /// plus the inputs read, for the snapshot.
    pub fn evaluate(
        &self,
        payload: &Value,
    ) -> Result<(i64, Value), RuleDecodeError> {
        match self {
            RuleSpec::Flat { amount } => Ok((*amount, Value::Object(Default::default()))),
            RuleSpec::PerUnit { field, unit_price } => {
                let units = numeric_field(payload, field)?;
                let amount = ceil_minor(units * unit_price);
                Ok((amount, serde_json::json!({ field.clone(): units })))
            }
            RuleSpec::Tiered { field, tiers } => {
                let units = numeric_field(payload, field)?;
                let mut remaining = units;
                let mut previous_bound = 0.0;
                let mut total = 0.0;
                for tier in tiers {
                    if remaining <= 0.0 {
                        break;
                    }
                    let span = match tier.up_to {
                        Some(bound) => (bound - previous_bound).max(0.0),
                        None => f64::INFINITY,
                    };
                    let in_tier = remaining.min(span);
                    total += in_tier * tier.unit_price;
                    remaining -= in_tier;
                    if let Some(bound) = tier.up_to {
                        previous_bound = bound;
                    }
                }
                Ok((ceil_minor(total), serde_json::json!({ field.clone(): units })))
            }
        }
    }
}

/// A conjunction of equality checks on `eventType` and scalar payload fields.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchSpec {
    checks: Vec<(String, Value)>,
}

impl MatchSpec {
    pub fn decode(raw: &Value) -> Result<Self, RuleDecodeError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| RuleDecodeError("match is not an object".into()))?;
        let mut checks = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            if value.is_object() || value.is_array() {
                return Err(RuleDecodeError(format!(
                    "match field {key:?} is not a scalar"
                )));
            }
            checks.push((key.clone(), value.clone()));
        }
        Ok(Self { checks })
    }

    pub fn matches(&self, event_type: &str, payload: &Value) -> bool {
        self.checks.iter().all(|(key, expected)| {
            if key == "eventType" {
                expected.as_str() == Some(event_type)
            } else {
                payload.get(key).map(|actual| scalar_eq(actual, expected)) == Some(true)
            }
        })
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        // Numeric comparison tolerates 3 vs 3.0.
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn required_str(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, RuleDecodeError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RuleDecodeError(format!("missing string field {key:?}")))
}

fn required_number(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<f64, RuleDecodeError> {
    obj.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| RuleDecodeError(format!("missing numeric field {key:?}")))
}

fn numeric_field(payload: &Value, field: &str) -> Result<f64, RuleDecodeError> {
    let value = payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| RuleDecodeError(format!("payload field {field:?} is not numeric")))?;
    if value < 0.0 {
        return Err(RuleDecodeError(format!(
            "payload field {field:?} is negative"
        )));
    }
    Ok(value)
}

/// Round toward +∞ so fractional units never under-bill.
fn ceil_minor(value: f64) -> i64 {
    value.ceil() as i64
}
