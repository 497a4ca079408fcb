use std::sync::Arc;

use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::telemetry::Metrics;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when no API key is configured; requests then fail with 500.
    pub upstream: Option<UpstreamClient>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Metrics,
}
