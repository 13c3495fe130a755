//! Declarative field mapping from an enriched lead to a CRM record
//!
//! A mapping is a JSON object of target key -> rule:
//!
//! ```json
//! {
//!   "phone": "caller_number",
//!   "lifecyclestage": {"const": "lead"},
//!   "description": {"template": "{analysis.intent} ({duration_seconds}s call)"},
//!   "priority": {"when": {"field": "lead_score", "op": "gte", "value": 70},
//!                "then": {"const": "high"}, "else": {"const": "normal"}}
//! }
//! ```

use crate::db::LeadRequest;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// One mapping rule
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldRule {
    /// Dotted path into the lead fields
    Path(String),
    Const {
        #[serde(rename = "const")]
        value: Value,
    },
    Template {
        template: String,
    },
    When {
        when: Condition,
        then: Box<FieldRule>,
        #[serde(default, rename = "else")]
        otherwise: Option<Box<FieldRule>>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

/// Target key -> rule
pub type FieldMap = BTreeMap<String, FieldRule>;

/// Read a field map out of an integration's settings, if it has one
pub fn field_map_from_settings(settings: &Value) -> Result<Option<FieldMap>> {
    match settings.get("field_map") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid CRM field_map: {}", e))),
    }
}

/// Flatten a request into the field namespace rules read from
pub fn lead_fields(request: &LeadRequest) -> Value {
    let analysis = request
        .analysis_json
        .as_deref()
        .and_then(|j| serde_json::from_str::<Value>(j).ok())
        .unwrap_or(Value::Null);

    json!({
        "request_id": request.id,
        "call_id": request.call_id,
        "caller_number": request.caller_number,
        "caller_name": request.caller_name,
        "city": request.city,
        "state": request.state,
        "duration_seconds": request.duration_seconds,
        "source": request.source,
        "tags": request.tags(),
        "lead_status": request.lead_status_hint,
        "lead_score": request.lead_score,
        "spam_likelihood": request.spam_likelihood,
        "transcript": request.transcript_text,
        "analysis": analysis,
        "received_at": request.created_at,
    })
}

/// Evaluate every rule; null results are omitted
pub fn apply(map: &FieldMap, fields: &Value) -> Map<String, Value> {
    map.iter()
        .filter_map(|(key, rule)| {
            let value = evaluate(rule, fields);
            (!value.is_null()).then(|| (key.clone(), value))
        })
        .collect()
}

/// Evaluate a single rule against the lead fields
pub fn evaluate(rule: &FieldRule, fields: &Value) -> Value {
    match rule {
        FieldRule::Path(path) => lookup(fields, path).cloned().unwrap_or(Value::Null),
        FieldRule::Const { value } => value.clone(),
        FieldRule::Template { template } => Value::String(render_template(template, fields)),
        FieldRule::When {
            when,
            then,
            otherwise,
        } => {
            if condition_holds(when, fields) {
                evaluate(then, fields)
            } else {
                otherwise
                    .as_ref()
                    .map(|rule| evaluate(rule, fields))
                    .unwrap_or(Value::Null)
            }
        }
    }
}

fn lookup<'a>(fields: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(fields, |current, key| match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn template_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").ok())
        .as_ref()
}

fn render_template(template: &str, fields: &Value) -> String {
    let Some(re) = template_regex() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
            match lookup(fields, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(", "),
                Some(other) => other.to_string(),
            }
        })
        .trim()
        .to_string()
}

fn condition_holds(condition: &Condition, fields: &Value) -> bool {
    let actual = lookup(fields, &condition.field).filter(|v| !v.is_null());
    let expected = &condition.value;

    match condition.op {
        CompareOp::Exists => actual.is_some(),
        CompareOp::Eq => actual == Some(expected),
        CompareOp::Ne => actual != Some(expected),
        CompareOp::Contains => match actual {
            Some(Value::String(s)) => expected.as_str().is_some_and(|needle| s.contains(needle)),
            Some(Value::Array(items)) => items.contains(expected),
            _ => false,
        },
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let (Some(a), Some(b)) = (actual.and_then(Value::as_f64), expected.as_f64()) else {
                return false;
            };
            match condition.op {
                CompareOp::Gt => a > b,
                CompareOp::Gte => a >= b,
                CompareOp::Lt => a < b,
                _ => a <= b,
            }
        }
    }
}
