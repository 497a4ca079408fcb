mod classify;
mod config;
mod connotation;
mod endpoint;
mod error;
mod extract;
mod handlers;
mod lookup;
mod models;
mod rate_limit;
mod redact;
mod repair;
mod schema;
mod state;
mod telemetry;
mod upstream;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;
use crate::telemetry::{
    init_logging, init_metrics, init_metrics_noop, init_tracer, init_tracer_noop,
    spawn_tracer_watchdog, Metrics,
};
use crate::upstream::UpstreamClient;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config error: {}", err);
            std::process::exit(1);
        }
    };

    let rate_limiter = Arc::new(RateLimiter::from_config(&config));

    let tracer_provider = match init_tracer(&config.observability) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("tracing init error (fallback to noop): {}", err);
            init_tracer_noop(config.observability.service_name.clone())
        }
    };
    let metrics = match init_metrics(&config.observability, rate_limiter.clone()) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("metrics init error (fallback to noop): {}", err);
            init_metrics_noop(rate_limiter.clone())
        }
    };

    init_logging(
        &config.observability.logging,
        &tracer_provider,
        &config.observability.service_name,
    );

    let exporters = &config.observability.exporters;
    tracing::info!(
        tracing_exporter = %exporters.tracing,
        metrics_exporter = %exporters.metrics,
        "telemetry configured"
    );
    let _tracer_watchdog =
        (exporters.tracing != "none").then(|| spawn_tracer_watchdog(tracer_provider.clone()));

    if let Err(err) = run(config, rate_limiter, metrics).await {
        tracing::error!(error = %format!("{:#}", err), "server stopped");
        std::process::exit(1);
    }
}

async fn run(config: Config, rate_limiter: Arc<RateLimiter>, metrics: Metrics) -> anyhow::Result<()> {
    let upstream = UpstreamClient::from_config(&config).context("building upstream client")?;
    if upstream.is_none() {
        tracing::warn!("OPENROUTER_API_KEY is not set; API requests will fail with 500");
    }

    let bind_addr = config.server.bind_addr.clone();
    let app = handlers::router(AppState {
        config: Arc::new(config),
        upstream,
        rate_limiter,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    tracing::info!("listening on {}", bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serving http")?;
    Ok(())
}
