use axum::extract::Query;
use axum::http::Uri;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::models::Issue;

/// Strict query validation: every key is required, unknown keys and
/// repeated keys are issues. Values are trimmed before the length rules
/// declared on `Q` run.
pub fn validate_query<Q>(uri: &Uri, keys: &[&'static str]) -> Result<Q, Vec<Issue>>
where
    Q: DeserializeOwned + Validate,
{
    let pairs = match Query::<Vec<(String, String)>>::try_from_uri(uri) {
        Ok(Query(pairs)) => pairs,
        Err(err) => return Err(vec![Issue::new("", err.body_text())]),
    };
    validate_pairs(pairs, keys)
}

pub fn validate_pairs<Q>(pairs: Vec<(String, String)>, keys: &[&'static str]) -> Result<Q, Vec<Issue>>
where
    Q: DeserializeOwned + Validate,
{
    let mut seen: HashMap<String, Vec<String>> = HashMap::new();
    let mut unknown: Vec<String> = Vec::new();
    for (key, value) in pairs {
        if !keys.iter().any(|known| *known == key) && !unknown.contains(&key) {
            unknown.push(key.clone());
        }
        seen.entry(key).or_default().push(value);
    }

    let mut structural: HashMap<&str, Issue> = HashMap::new();
    let mut values = Map::new();
    for &key in keys {
        match seen.get(key).map(Vec::as_slice) {
            None => {
                structural.insert(key, Issue::new(key, "Required"));
            }
            Some([value]) => {
                values.insert(key.to_string(), Value::String(value.trim().to_string()));
            }
            Some(_) => {
                structural.insert(key, Issue::new(key, "Expected string, received array"));
            }
        }
    }

    let query: Q = serde_json::from_value(Value::Object(values))
        .map_err(|err| vec![Issue::new("", err.to_string())])?;
    let mut rule_issues = match query.validate() {
        Ok(()) => HashMap::new(),
        Err(errors) => field_issues(&errors),
    };

    let mut issues: Vec<Issue> = keys
        .iter()
        .filter_map(|key| structural.remove(key).or_else(|| rule_issues.remove(*key)))
        .collect();

    if !unknown.is_empty() {
        let keys = unknown
            .iter()
            .map(|k| format!("'{}'", k))
            .collect::<Vec<_>>()
            .join(", ");
        issues.push(Issue::new("", format!("Unrecognized key(s) in object: {}", keys)));
    }

    if issues.is_empty() {
        Ok(query)
    } else {
        Err(issues)
    }
}

/// A parsed completion that does not have the expected response shape.
#[derive(Debug, Error)]
#[error("{label} response failed schema validation: {message}")]
pub struct SchemaError {
    pub label: String,
    pub message: String,
}

pub fn validate_shape<T>(value: Value, label: &str) -> Result<T, SchemaError>
where
    T: DeserializeOwned + Validate,
{
    let schema_error = |message: String| SchemaError {
        label: label.to_string(),
        message,
    };
    let parsed: T = serde_json::from_value(value).map_err(|e| schema_error(e.to_string()))?;
    parsed.validate().map_err(|errors| {
        let mut issues: Vec<Issue> = field_issues(&errors).into_values().collect();
        issues.sort_by(|a, b| a.path.cmp(&b.path));
        let message = issues
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.message))
            .collect::<Vec<_>>()
            .join("; ");
        schema_error(message)
    })?;
    Ok(parsed)
}

/// First failure per field, keyed by the field's wire name.
fn field_issues(errors: &ValidationErrors) -> HashMap<String, Issue> {
    let mut issues = HashMap::new();
    for (field, field_errors) in errors.field_errors() {
        let path = camel_case(&field);
        if let Some(error) = field_errors.first() {
            issues.insert(path.clone(), Issue::new(path, describe(error)));
        }
    }
    issues
}

fn describe(error: &ValidationError) -> String {
    if error.code != "length" {
        return error
            .message
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Invalid value ({})", error.code));
    }

    let bound = |key: &str| error.params.get(key).and_then(Value::as_u64);
    let (noun, unit, len) = match error.params.get("value") {
        Some(Value::Array(items)) => ("Array", "element(s)", Some(items.len() as u64)),
        Some(Value::String(text)) => ("String", "character(s)", Some(text.chars().count() as u64)),
        _ => ("Value", "item(s)", None),
    };
    match (bound("min"), bound("max"), len) {
        (Some(min), _, Some(len)) if len < min => {
            format!("{} must contain at least {} {}", noun, min, unit)
        }
        (_, Some(max), _) => format!("{} must contain at most {} {}", noun, max, unit),
        (Some(min), None, _) => format!("{} must contain at least {} {}", noun, min, unit),
        (None, None, _) => "Invalid length".to_string(),
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for ch in field.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}
