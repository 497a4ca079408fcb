use axum::http::HeaderMap;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

static API_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sk-(?:or-v1-)?[A-Za-z0-9]{10,}").expect("api key pattern is valid")
});

const SENSITIVE_KEYS: [&str; 8] = [
    "apikey",
    "api_key",
    "authorization",
    "cookie",
    "password",
    "secret",
    "token",
    "x-api-key",
];

pub fn redact_secrets(text: &str) -> Cow<'_, str> {
    API_KEY.replace_all(text, "[REDACTED]")
}

pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_secrets(s).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = if is_sensitive(key) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        redact_value(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn headers_for_log(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive(name.as_str()) {
                "[REDACTED]".to_string()
            } else {
                redact_secrets(value.to_str().unwrap_or("[invalid]")).into_owned()
            };
            (name.to_string(), value)
        })
        .collect()
}

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}
