use reqwest::header::RETRY_AFTER;
use serde_json::Value;

use crate::error::PipelineError;

const DEFAULT_RETRY_AFTER: &str = "60";
const UPSTREAM_RATE_LIMITED: &str = "Rate limit exceeded. Please wait.";
const GENERIC_UPSTREAM_ERROR: &str = "Upstream API Error";

/// Outward status and message derived from a failed pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub status: u16,
    /// Only set for upstream 429s; such responses carry nothing else.
    pub retry_after: Option<String>,
    pub error: String,
    pub upstream_message: Option<String>,
}

pub fn classify(err: &PipelineError, captured_body: &str, billing_message: &str) -> Classification {
    let upstream = match err {
        PipelineError::Upstream(upstream) => Some(upstream),
        _ => None,
    };

    if let Some(upstream) = upstream.filter(|u| u.status == 429) {
        let retry_after = upstream
            .headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Classification {
            status: 429,
            retry_after: Some(retry_after.to_string()),
            error: UPSTREAM_RATE_LIMITED.to_string(),
            upstream_message: None,
        };
    }

    let status = upstream.map(|u| u.status).unwrap_or(500);
    let upstream_message = upstream
        .and_then(|u| u.error.as_ref())
        .and_then(nested_message)
        .or_else(|| captured_message(captured_body));

    let error = if status == 402 {
        billing_message.to_string()
    } else {
        let message = err.to_string();
        if message.trim().is_empty() {
            GENERIC_UPSTREAM_ERROR.to_string()
        } else {
            message
        }
    };

    Classification {
        status,
        retry_after: None,
        error,
        upstream_message,
    }
}

fn nested_message(error: &Value) -> Option<String> {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn captured_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
