use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL,
};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use opentelemetry::KeyValue;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn, Instrument};

use crate::classify::classify;
use crate::connotation::Connotation;
use crate::endpoint::{build_request, parse_query, LlmEndpoint};
use crate::error::{ApiError, PipelineError};
use crate::extract::parse_completion;
use crate::lookup::Lookup;
use crate::models::ChatCompletionRequest;
use crate::rate_limit::extract_client_ip;
use crate::redact::{headers_for_log, redact_secrets, redact_value};
use crate::state::AppState;
use crate::upstream::{ErrorBodyCapture, UpstreamClient};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/lookup", any(lookup))
        .route("/api/connotation", any(connotation))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn lookup(State(state): State<AppState>, request: Request) -> Response {
    handle_llm_request::<Lookup>(state, request).await
}

pub async fn connotation(State(state): State<AppState>, request: Request) -> Response {
    handle_llm_request::<Connotation>(state, request).await
}

pub async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok"
    }))
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("req-{}-{}", ts, seq)
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET,OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    headers
}

/// Shared request path for every [`LlmEndpoint`]. Every outcome, including
/// failures, becomes a response here.
async fn handle_llm_request<E: LlmEndpoint>(state: AppState, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    let mut headers = cors_headers();

    if parts.method == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        response.headers_mut().extend(headers);
        return response;
    }

    let request_id = next_request_id();
    let start = Instant::now();
    let span = tracing::info_span!("api.request", request_id = %request_id, endpoint = E::LABEL);
    let endpoint = KeyValue::new("endpoint", E::LABEL);
    state.metrics.requests.add(1, &[endpoint.clone()]);

    let outcome = run_request::<E>(&state, &parts, &request_id, &mut headers)
        .instrument(span)
        .await;
    let latency_ms = start.elapsed().as_millis();
    state
        .metrics
        .latency_ms
        .record(latency_ms as f64, &[endpoint.clone()]);

    let mut response = match outcome {
        Ok(response) => {
            info!(
                request_id = %request_id,
                endpoint = E::LABEL,
                latency_ms = latency_ms,
                status = 200u16,
                "request completed"
            );
            response
        }
        Err(err) => {
            state
                .metrics
                .errors
                .add(1, &[endpoint, KeyValue::new("type", err.kind)]);
            log_error(&request_id, E::LABEL, latency_ms, &err);
            err.into_response()
        }
    };
    response.headers_mut().extend(headers);
    response
}

async fn run_request<E: LlmEndpoint>(
    state: &AppState,
    parts: &Parts,
    request_id: &str,
    headers: &mut HeaderMap,
) -> Result<Response, ApiError> {
    if parts.method != Method::GET {
        return Err(ApiError::method_not_allowed());
    }

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = extract_client_ip(&parts.headers, remote);

    let query = match parse_query::<E>(&parts.uri) {
        Ok(query) => query,
        Err(issues) => {
            state.rate_limiter.peek(&client_ip).write_headers(headers);
            return Err(ApiError::invalid_query(issues));
        }
    };

    let decision = state.rate_limiter.check(&client_ip);
    decision.write_headers(headers);
    if !decision.allowed {
        state
            .metrics
            .rate_limited
            .add(1, &[KeyValue::new("endpoint", E::LABEL)]);
        info!(
            request_id = %request_id,
            client_ip = %client_ip,
            retry_after_secs = decision.retry_after_secs,
            "client rate limited"
        );
        return Err(ApiError::rate_limited(
            decision.retry_after_secs,
            decision.limit,
            &state.rate_limiter.window_phrase(),
        ));
    }

    let Some(client) = state.upstream.as_ref() else {
        return Err(ApiError::misconfigured());
    };

    let settings = E::settings(&state.config.endpoints);
    let completion_request = build_request::<E>(&state.config, &query);
    let capture = ErrorBodyCapture::new();

    match complete::<E>(client, &completion_request, &capture).await {
        Ok(output) => {
            let mut response = Json(output).into_response();
            if let Some(cache_control) = settings.cache_control.as_deref() {
                match HeaderValue::from_str(cache_control) {
                    Ok(value) => {
                        response.headers_mut().insert(CACHE_CONTROL, value);
                    }
                    Err(_) => warn!(
                        endpoint = E::LABEL,
                        cache_control = %cache_control,
                        "invalid cache_control setting ignored"
                    ),
                }
            }
            Ok(response)
        }
        Err(err) => {
            log_pipeline_failure(request_id, E::LABEL, &err, &capture);
            let classification = classify(&err, capture.body(), &settings.billing_message);
            Err(ApiError::from_classification(err.class(), classification))
        }
    }
}

async fn complete<E: LlmEndpoint>(
    client: &UpstreamClient,
    request: &ChatCompletionRequest,
    capture: &ErrorBodyCapture,
) -> Result<E::Output, PipelineError> {
    let completion = client.create_chat_completion(request, capture).await?;
    let value = parse_completion(&completion.into_content(), E::LABEL)?;
    Ok(E::validate(value)?)
}

fn log_pipeline_failure(
    request_id: &str,
    endpoint: &str,
    err: &PipelineError,
    capture: &ErrorBodyCapture,
) {
    match err {
        PipelineError::Upstream(upstream) => warn!(
            request_id = %request_id,
            endpoint = %endpoint,
            error_class = err.class(),
            upstream_status = upstream.status,
            upstream_headers = ?headers_for_log(&upstream.headers),
            upstream_error = %upstream.error.as_ref().map(redact_value).unwrap_or_default(),
            upstream_body = %redact_secrets(capture.body()),
            "upstream call failed"
        ),
        PipelineError::Transport(source) => warn!(
            request_id = %request_id,
            endpoint = %endpoint,
            error_class = err.class(),
            error = %redact_secrets(&source.to_string()),
            "upstream transport failed"
        ),
        PipelineError::Envelope(source) => warn!(
            request_id = %request_id,
            endpoint = %endpoint,
            error_class = err.class(),
            error = %source,
            "upstream returned an unreadable completion envelope"
        ),
        PipelineError::Parse(parse) => tracing::error!(
            request_id = %request_id,
            endpoint = %endpoint,
            error_class = err.class(),
            error = %parse,
            "completion could not be parsed"
        ),
        PipelineError::Schema(schema) => warn!(
            request_id = %request_id,
            endpoint = %endpoint,
            error_class = err.class(),
            error = %redact_secrets(&schema.message),
            "completion failed schema validation"
        ),
    }
}

fn log_error(request_id: &str, endpoint: &str, latency_ms: u128, err: &ApiError) {
    info!(
        request_id = %request_id,
        endpoint = %endpoint,
        latency_ms = latency_ms,
        status = err.status.as_u16(),
        error_type = %err.kind,
        "request failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_BILLING_MESSAGE};
    use crate::rate_limit::RateLimiter;
    use crate::telemetry::init_metrics_noop;
    use axum::body::Body;
    use axum::http::header::RETRY_AFTER;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_app(server: Option<&MockServer>, configure: impl FnOnce(&mut Config)) -> Router {
        let mut config = Config::default();
        if let Some(server) = server {
            config.upstream.base_url = server.uri();
            config.upstream.api_key = Some("sk-test-key".to_string());
        }
        configure(&mut config);
        let rate_limiter = Arc::new(RateLimiter::from_config(&config));
        let upstream = UpstreamClient::from_config(&config).expect("client");
        router(AppState {
            config: Arc::new(config),
            upstream,
            rate_limiter: rate_limiter.clone(),
            metrics: init_metrics_noop(rate_limiter),
        })
    }

    fn get(uri: &str) -> Request {
        HttpRequest::builder()
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .expect("request")
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        }))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn bright_entry() -> Value {
        json!({
            "word": "bright",
            "phonetics": ["/braɪt/"],
            "items": [{
                "partOfSpeech": "adjective",
                "meanings": [{
                    "definition": "giving out or reflecting much light",
                    "example": {"en": "a bright morning", "zh": "明亮的早晨"},
                    "synonyms": [{"en": "shining", "zh": "闪耀的"}, {"en": "radiant"}]
                }]
            }]
        })
    }

    fn connotation_entry() -> Value {
        json!({
            "headword": "happy",
            "synonym": "elated",
            "partOfSpeech": "adjective",
            "definition": "feeling pleasure",
            "polarity": "positive",
            "register": "neutral",
            "toneTags": [{"en": "intense", "zh": "强烈"}, {"en": "celebratory"}],
            "usageNote": {"en": "Stronger and more momentary than happy."}
        })
    }

    #[tokio::test]
    async fn lookup_returns_validated_entry_with_cache_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\\\"bright\\\""))
            .and(body_string_contains("\"temperature\":0.0"))
            .respond_with(completion(&bright_entry().to_string()))
            .expect(1)
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |_| {})
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CACHE_CONTROL],
            "public, s-maxage=86400, stale-while-revalidate=604800"
        );
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()["x-ratelimit-limit"], "20");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "19");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        assert_eq!(body_json(response).await, bright_entry());
    }

    #[tokio::test]
    async fn fenced_completion_with_preamble_still_succeeds() {
        let server = MockServer::start().await;
        let content = format!("Sure! Here you go:\n```json\n{}\n```", bright_entry());
        Mock::given(method("POST"))
            .respond_with(completion(&content))
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |_| {})
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, bright_entry());
    }

    #[tokio::test]
    async fn disabled_cache_control_is_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(&bright_entry().to_string()))
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |c| c.endpoints.lookup.cache_control = None)
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(CACHE_CONTROL));
    }

    #[tokio::test]
    async fn preflight_and_wrong_method() {
        let app = test_app(None, |_| {});
        let preflight = HttpRequest::builder()
            .method(Method::OPTIONS)
            .uri("/api/lookup")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(preflight).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "GET,OPTIONS");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert!(bytes.is_empty());

        let post = HttpRequest::builder()
            .method(Method::POST)
            .uri("/api/connotation")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(post).await.expect("response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(body_json(response).await, json!({"error": "Method Not Allowed"}));
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected_without_spending_quota() {
        let app = test_app(None, |c| c.rate_limit.max_requests = 1);
        let long = "a".repeat(101);

        let response = app
            .clone()
            .oneshot(get(&format!("/api/lookup?word={long}")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        let body = body_json(response).await;
        assert_eq!(body["error"], "Invalid query parameters");
        assert_eq!(body["issues"][0]["path"], "word");
        assert!(body["issues"][0]["message"]
            .as_str()
            .expect("message")
            .contains("at most 80"));

        for uri in ["/api/lookup", "/api/lookup?word=", "/api/lookup?word=%20%20", "/api/lookup?word=ok&lang=en"] {
            let response = app.clone().oneshot(get(uri)).await.expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(response.headers()["x-ratelimit-remaining"], "1", "{uri}");
        }

        // Quota is untouched: the single allowed request still gets through
        // to the credential check.
        let response = app.oneshot(get("/api/lookup?word=ok")).await.expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[tokio::test]
    async fn missing_api_key_is_a_misconfiguration() {
        let response = test_app(None, |_| {})
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["x-ratelimit-limit"], "20");
        assert!(!response.headers().contains_key(CACHE_CONTROL));
        assert_eq!(
            body_json(response).await,
            json!({"error": "Server misconfiguration: Missing API Key"})
        );
    }

    #[tokio::test]
    async fn over_limit_requests_never_reach_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(&bright_entry().to_string()))
            .expect(1)
            .mount(&server)
            .await;
        let app = test_app(Some(&server), |c| c.rate_limit.max_requests = 1);

        let first = app
            .clone()
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
        assert!(!second.headers().contains_key(CACHE_CONTROL));
        let retry_after: u64 = second.headers()[RETRY_AFTER]
            .to_str()
            .expect("ascii")
            .parse()
            .expect("seconds");
        assert!(retry_after > 0);
        assert_eq!(
            body_json(second).await,
            json!({"error": "Rate limit exceeded. Max 1 requests per hour per IP."})
        );
    }

    #[tokio::test]
    async fn upstream_billing_error_uses_configured_guidance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({
                "error": {"message": "Insufficient credits", "code": 402}
            })))
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |_| {})
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            body_json(response).await,
            json!({
                "error": DEFAULT_BILLING_MESSAGE,
                "upstream_status": 402,
                "upstream_message": "Insufficient credits"
            })
        );
    }

    #[tokio::test]
    async fn upstream_rate_limit_forwards_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "12")
                    .set_body_json(json!({"error": {"message": "Provider busy"}})),
            )
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |_| {})
            .oneshot(get("/api/connotation?headword=happy&synonym=elated&partOfSpeech=adjective&definition=feeling%20pleasure"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "12");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "19");
        assert_eq!(
            body_json(response).await,
            json!({"error": "Rate limit exceeded. Please wait."})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_failures_keep_their_own_upstream_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("quartz"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string(r#"{"message":"Error A"}"#)
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("zephyr"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"message":"Error B"}"#))
            .mount(&server)
            .await;

        let app = test_app(Some(&server), |_| {});
        let (a, b) = tokio::join!(
            app.clone().oneshot(get("/api/lookup?word=quartz")),
            app.clone().oneshot(get("/api/lookup?word=zephyr")),
        );
        let a = body_json(a.expect("response a")).await;
        let b = body_json(b.expect("response b")).await;
        assert_eq!(a["upstream_message"], "Error A");
        assert_eq!(b["upstream_message"], "Error B");
        assert_eq!(a["upstream_status"], 500);
    }

    #[tokio::test]
    async fn raw_upstream_json_never_reaches_the_error_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string(r#"{"message":"Error A","detail":"x"}"#),
            )
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |_| {})
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({
                "error": "500 status code (no body)",
                "upstream_status": 500,
                "upstream_message": "Error A"
            })
        );
    }

    #[tokio::test]
    async fn unparseable_completion_is_a_generic_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(""))
            .mount(&server)
            .await;

        let response = test_app(Some(&server), |_| {})
            .oneshot(get("/api/lookup?word=bright"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(CACHE_CONTROL));
        let body = body_json(response).await;
        assert_eq!(body["error"], "Failed to parse AI response");
        assert_eq!(body["upstream_status"], 500);
    }

    #[tokio::test]
    async fn connotation_succeeds_and_schema_drift_is_a_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("elated"))
            .respond_with(completion(&connotation_entry().to_string()))
            .mount(&server)
            .await;
        let mut drifted = connotation_entry();
        drifted["polarity"] = json!("ecstatic");
        Mock::given(method("POST"))
            .and(body_string_contains("joyful"))
            .respond_with(completion(&drifted.to_string()))
            .mount(&server)
            .await;
        let app = test_app(Some(&server), |_| {});

        let ok = app
            .clone()
            .oneshot(get("/api/connotation?headword=happy&synonym=elated&partOfSpeech=adjective&definition=feeling%20pleasure"))
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await, connotation_entry());

        let drift = app
            .oneshot(get("/api/connotation?headword=happy&synonym=joyful&partOfSpeech=adjective&definition=feeling%20pleasure"))
            .await
            .expect("response");
        assert_eq!(drift.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(drift).await["error"], "Failed to parse AI response");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = test_app(None, |_| {})
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
    }
}
