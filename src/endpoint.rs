use axum::http::Uri;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::config::{Config, EndpointConfig, EndpointsConfig};
use crate::models::{
    ChatCompletionRequest, ChatMessage, Issue, JsonSchemaFormat, ProviderPreferences,
    ReasoningOptions, ResponseFormat,
};
use crate::schema::{validate_query, validate_shape, SchemaError};

/// One LLM-backed GET endpoint: its query contract, prompt and result shape.
pub trait LlmEndpoint: Send + Sync + 'static {
    type Query: DeserializeOwned + Validate + Send;
    type Output: Serialize + DeserializeOwned + Validate + Send;

    /// Used in logs, metrics and error labels.
    const LABEL: &'static str;
    const SCHEMA_NAME: &'static str;
    /// Query keys in the order their issues are reported.
    const FIELDS: &'static [&'static str];

    fn settings(endpoints: &EndpointsConfig) -> &EndpointConfig;

    fn messages(query: &Self::Query) -> Vec<ChatMessage>;

    /// JSON Schema handed to the provider as a structured-output constraint.
    fn response_schema() -> Value;

    fn validate(value: Value) -> Result<Self::Output, SchemaError> {
        validate_shape(value, Self::LABEL)
    }
}

pub fn parse_query<E: LlmEndpoint>(uri: &Uri) -> Result<E::Query, Vec<Issue>> {
    validate_query(uri, E::FIELDS)
}

/// Deterministic completion request for a validated query.
pub fn build_request<E: LlmEndpoint>(config: &Config, query: &E::Query) -> ChatCompletionRequest {
    let settings = E::settings(&config.endpoints);
    ChatCompletionRequest {
        model: config.model_for(settings).to_string(),
        messages: E::messages(query),
        temperature: 0.0,
        response_format: Some(ResponseFormat::JsonSchema {
            json_schema: JsonSchemaFormat {
                name: E::SCHEMA_NAME.to_string(),
                strict: true,
                schema: E::response_schema(),
            },
        }),
        provider: (!settings.provider_only.is_empty()).then(|| ProviderPreferences {
            only: settings.provider_only.clone(),
            allow_fallbacks: settings.allow_fallbacks,
        }),
        reasoning: settings
            .reasoning_effort
            .as_ref()
            .map(|effort| ReasoningOptions {
                effort: effort.clone(),
                exclude: true,
            }),
    }
}

/// Schema fragment for a `{en, zh?}` pair.
pub fn bilingual_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "en": { "type": "string" },
            "zh": { "type": "string" }
        },
        "required": ["en"]
    })
}
