use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, Response};
use std::sync::OnceLock;
use thiserror::Error;

use crate::config::Config;
use crate::error::{PipelineError, UpstreamError};
use crate::models::{ChatCompletion, ChatCompletionRequest};

pub const MAX_CAPTURED_BODY_BYTES: usize = 8192;

/// Raw body of a failed upstream call, filled at most once.
///
/// One instance is created per request and handed to the call by reference,
/// so concurrent requests never see each other's bodies.
#[derive(Debug, Default)]
pub struct ErrorBodyCapture(OnceLock<String>);

impl ErrorBodyCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, body: String) {
        let _ = self.0.set(body);
    }

    pub fn body(&self) -> &str {
        self.0.get().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
    #[error("invalid proxy url: {0}")]
    Proxy(#[source] reqwest::Error),
    #[error("http client build error: {0}")]
    Build(#[source] reqwest::Error),
}

/// Chat-completions client bound to the configured gateway.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    completions_url: String,
}

impl UpstreamClient {
    /// Returns `None` when no API key is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, ClientBuildError> {
        let upstream = &config.upstream;
        let Some(api_key) = upstream.api_key.as_deref() else {
            return Ok(None);
        };

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| ClientBuildError::InvalidHeader("Authorization"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            HeaderName::from_static("http-referer"),
            HeaderValue::from_str(&upstream.referer)
                .map_err(|_| ClientBuildError::InvalidHeader("HTTP-Referer"))?,
        );
        headers.insert(
            HeaderName::from_static("x-title"),
            HeaderValue::from_str(&upstream.app_title)
                .map_err(|_| ClientBuildError::InvalidHeader("X-Title"))?,
        );

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(upstream.pool_max_idle_per_host)
            .connect_timeout(config.connect_timeout());
        if let Some(timeout) = config.read_timeout() {
            builder = builder.timeout(timeout);
        }
        builder = match upstream.proxy_url.as_deref() {
            Some(url) => builder.proxy(reqwest::Proxy::all(url).map_err(ClientBuildError::Proxy)?),
            None => builder.no_proxy(),
        };

        let http = builder.build().map_err(ClientBuildError::Build)?;
        Ok(Some(Self {
            http,
            completions_url: config.chat_completions_url(),
        }))
    }

    pub async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
        capture: &ErrorBodyCapture,
    ) -> Result<ChatCompletion, PipelineError> {
        let builder = self.http.post(&self.completions_url).json(request);
        let response = send_inspected(builder, |body| capture.record(body))
            .await
            .map_err(PipelineError::Transport)?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(PipelineError::Transport)?;
        if !status.is_success() {
            return Err(PipelineError::Upstream(UpstreamError::from_response(
                status, headers, &text,
            )));
        }
        serde_json::from_str(&text).map_err(PipelineError::Envelope)
    }
}

/// Sends `request`; on a non-2xx status, passes up to
/// [`MAX_CAPTURED_BODY_BYTES`] of the body to `on_error_body` and returns an
/// equivalent response whose body is still fully readable.
pub async fn send_inspected<F>(
    request: RequestBuilder,
    on_error_body: F,
) -> Result<Response, reqwest::Error>
where
    F: FnOnce(String),
{
    let response = request.send().await?;
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let version = response.version();
    let headers = response.headers().clone();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            on_error_body(String::new());
            return Err(err);
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    on_error_body(truncate_at_char_boundary(&text, MAX_CAPTURED_BODY_BYTES).to_string());

    let mut rebuilt = http::Response::new(bytes);
    *rebuilt.status_mut() = status;
    *rebuilt.version_mut() = version;
    *rebuilt.headers_mut() = headers;
    Ok(Response::from(rebuilt))
}

fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
