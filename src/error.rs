use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::classify::Classification;
use crate::extract::ParseError;
use crate::models::Issue;
use crate::redact::redact_secrets;
use crate::schema::SchemaError;

pub const PARSE_FAILURE_MESSAGE: &str = "Failed to parse AI response";

/// A non-2xx answer from the provider, shaped like an SDK API error.
#[derive(Clone, Debug)]
pub struct UpstreamError {
    pub status: u16,
    pub headers: HeaderMap,
    /// The `error` member of the provider's JSON body, whatever its type.
    pub error: Option<Value>,
    pub message: String,
}

impl UpstreamError {
    /// Only the `error` member or a non-JSON body contributes detail to the
    /// message, and that detail is redacted. Other JSON bodies stay in the
    /// error-body capture.
    pub fn from_response(status: StatusCode, headers: HeaderMap, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let error = parsed.as_ref().and_then(|p| p.get("error").cloned());
        let detail = match (&error, &parsed) {
            (Some(Value::Object(obj)), _) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            (Some(other), _) => other.to_string(),
            (None, None) if !body.trim().is_empty() => body.trim().chars().take(200).collect(),
            (None, _) => "status code (no body)".to_string(),
        };
        Self {
            status: status.as_u16(),
            headers,
            error,
            message: format!("{} {}", status.as_u16(), redact_secrets(&detail)),
        }
    }
}

/// Anything that can go wrong between admitting a request and returning its
/// validated result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{}", .0.message)]
    Upstream(UpstreamError),
    #[error("Connection error.")]
    Transport(#[source] reqwest::Error),
    #[error("Invalid completion envelope from upstream")]
    Envelope(#[source] serde_json::Error),
    #[error("{}", PARSE_FAILURE_MESSAGE)]
    Parse(#[from] ParseError),
    #[error("{}", PARSE_FAILURE_MESSAGE)]
    Schema(#[from] SchemaError),
}

impl PipelineError {
    pub fn class(&self) -> &'static str {
        match self {
            PipelineError::Upstream(_) => "upstream_http",
            PipelineError::Transport(_) => "transport",
            PipelineError::Envelope(_) => "envelope",
            PipelineError::Parse(_) => "parse",
            PipelineError::Schema(_) => "schema",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<Issue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_message: Option<String>,
}

impl ErrorBody {
    fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            issues: None,
            upstream_status: None,
            upstream_message: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub retry_after: Option<String>,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            kind: "method",
            retry_after: None,
            body: ErrorBody::message("Method Not Allowed"),
        }
    }

    pub fn invalid_query(issues: Vec<Issue>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            retry_after: None,
            body: ErrorBody {
                issues: Some(issues),
                ..ErrorBody::message("Invalid query parameters")
            },
        }
    }

    pub fn rate_limited(retry_after_secs: u64, limit: u32, window: &str) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            kind: "rate_limit",
            retry_after: Some(retry_after_secs.to_string()),
            body: ErrorBody::message(format!(
                "Rate limit exceeded. Max {} requests per {} per IP.",
                limit, window
            )),
        }
    }

    pub fn misconfigured() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "configuration",
            retry_after: None,
            body: ErrorBody::message("Server misconfiguration: Missing API Key"),
        }
    }

    pub fn from_classification(kind: &'static str, classification: Classification) -> Self {
        let status = StatusCode::from_u16(classification.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if classification.retry_after.is_some() {
            return Self {
                status,
                kind,
                retry_after: classification.retry_after,
                body: ErrorBody::message(classification.error),
            };
        }
        Self {
            status,
            kind,
            retry_after: None,
            body: ErrorBody {
                upstream_status: Some(classification.status),
                upstream_message: classification.upstream_message,
                ..ErrorBody::message(classification.error)
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(value) = self
            .retry_after
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}
