use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const DEFAULT_BILLING_MESSAGE: &str =
    "Upstream billing/quota required. Please add billing or credits in your provider dashboard.";

pub const DEFAULT_CACHE_CONTROL: &str = "public, s-maxage=86400, stale-while-revalidate=604800";

/// Proxy variables, highest priority first.
pub const PROXY_ENV_VARS: [&str; 5] = [
    "OPENROUTER_PROXY_URL",
    "HTTPS_PROXY",
    "HTTP_PROXY",
    "https_proxy",
    "http_proxy",
];

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    /// Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_app_title")]
    pub app_title: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            proxy_url: None,
            referer: default_referer(),
            app_title: default_app_title(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max")]
    pub max_requests: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max(),
            window_secs: default_rate_limit_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default)]
    pub lookup: EndpointConfig,
    #[serde(default)]
    pub connotation: EndpointConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `None` leaves successful responses without a Cache-Control header.
    pub cache_control: Option<String>,
    pub billing_message: String,
    pub model: Option<String>,
    pub provider_only: Vec<String>,
    pub allow_fallbacks: bool,
    pub reasoning_effort: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            cache_control: Some(DEFAULT_CACHE_CONTROL.to_string()),
            billing_message: DEFAULT_BILLING_MESSAGE.to_string(),
            model: None,
            provider_only: Vec::new(),
            allow_fallbacks: true,
            reasoning_effort: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub exporters: ExportersConfig,
    #[serde(default)]
    pub otlp_grpc: OtlpGrpcConfig,
    #[serde(default)]
    pub otlp_http: OtlpHttpConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            exporters: ExportersConfig::default(),
            otlp_grpc: OtlpGrpcConfig::default(),
            otlp_http: OtlpHttpConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stdout: default_log_stdout(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExportersConfig {
    #[serde(default = "default_exporter_kind")]
    pub tracing: String,
    #[serde(default = "default_exporter_kind")]
    pub metrics: String,
}

impl Default for ExportersConfig {
    fn default() -> Self {
        Self {
            tracing: default_exporter_kind(),
            metrics: default_exporter_kind(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpGrpcConfig {
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OtlpGrpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
            timeout_ms: default_otlp_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpHttpConfig {
    #[serde(default = "default_otlp_http_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OtlpHttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_otlp_http_base_url(),
            public_key: String::new(),
            secret_key: String::new(),
            timeout_ms: default_otlp_timeout_ms(),
        }
    }
}

impl OtlpHttpConfig {
    pub fn traces_endpoint(&self) -> String {
        format!("{}/v1/traces", self.base_url.trim_end_matches('/'))
    }

    pub fn metrics_endpoint(&self) -> String {
        format!("{}/v1/metrics", self.base_url.trim_end_matches('/'))
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Reads the optional YAML file named by `CONFIG_PATH`, then lets
    /// environment variables override it.
    pub fn load_with<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut config = match env("CONFIG_PATH") {
            Some(path) => {
                let content = fs::read_to_string(&path)
                    .map_err(|e| format!("CONFIG_PATH read error: {}", e))?;
                Self::from_yaml(&content)?
            }
            None => Config::default(),
        };

        config.upstream.api_key = env("OPENROUTER_API_KEY");
        if let Some(model) = env("OPENROUTER_MODEL") {
            config.upstream.model = model;
        }
        if let Some(base_url) = env("OPENROUTER_BASE_URL") {
            config.upstream.base_url = base_url;
        }
        if let Some(proxy) = PROXY_ENV_VARS.iter().find_map(|name| env(*name)) {
            config.upstream.proxy_url = Some(proxy);
        }
        if let Some(referer) = env("OPENROUTER_SITE_URL").or_else(|| env("VERCEL_URL")) {
            config.upstream.referer = referer;
        }
        if let Some(title) = env("OPENROUTER_APP_NAME") {
            config.upstream.app_title = title;
        }
        if let Some(bind_addr) = env("BIND_ADDR") {
            config.server.bind_addr = bind_addr;
        }

        config.normalize()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, String> {
        serde_yaml::from_str(content).map_err(|e| format!("CONFIG_PATH invalid yaml: {}", e))
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.upstream.base_url.trim_end_matches('/'))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.upstream.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn rate_limit_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.cleanup_interval_secs)
    }

    /// Model for an endpoint: its own override, else the upstream default.
    pub fn model_for<'a>(&'a self, endpoint: &'a EndpointConfig) -> &'a str {
        endpoint.model.as_deref().unwrap_or(&self.upstream.model)
    }

    fn normalize(&mut self) -> Result<(), String> {
        let logging = &mut self.observability.logging;
        logging.format = logging.format.to_lowercase();
        logging.level = logging.level.to_lowercase();
        match logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(format!("logging.format invalid: {}", other)),
        }
        match logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("logging.level invalid: {}", other)),
        }
        for kind in [
            &self.observability.exporters.tracing,
            &self.observability.exporters.metrics,
        ] {
            match kind.as_str() {
                "none" | "otlp_grpc" | "otlp_http" => {}
                other => return Err(format!("exporter kind invalid: {}", other)),
            }
        }
        if self.rate_limit.max_requests == 0 {
            return Err("rate_limit.max_requests must be at least 1".to_string());
        }
        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs must be at least 1".to_string());
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err("upstream.base_url is required".to_string());
        }
        Ok(())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "google/gemini-3-flash-preview".to_string()
}

fn default_referer() -> String {
    "http://localhost".to_string()
}

fn default_app_title() -> String {
    "Syno-Eager".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_pool_max_idle_per_host() -> usize {
    16
}

fn default_rate_limit_max() -> u32 {
    20
}

fn default_rate_limit_window_secs() -> u64 {
    60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_service_name() -> String {
    "syno-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_exporter_kind() -> String {
    "none".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otlp_timeout_ms() -> u64 {
    3000
}

fn default_otlp_http_base_url() -> String {
    "http://localhost:4318".to_string()
}
