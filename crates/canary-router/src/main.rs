//! canary-router - canary-deploy traffic router daemon.
//!
//! The daemon wires the core pieces together and runs them for the lifetime
//! of the process:
//!
//! - a metric predicate evaluating the configured query against the metric
//!   store once a second, authenticated through UAA;
//! - a route planner walking the configured rollout plan, reporting
//!   lifecycle events on stdout for the deployment tool driving this
//!   process;
//! - the split proxy serving on the configured port.
//!
//! Logs go to stderr so they never collide with the event stream on stdout.
//! All configuration arrives via environment variables; anything missing or
//! malformed stops the process before it accepts traffic.

mod config;
mod logcache;
mod uaa;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canary_core::events::EventWriter;
use canary_core::planner::RoutePlanner;
use canary_core::predicate::{self, MetricPredicate};
use canary_core::proxy::{ProxyOptions, SplitProxy};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::logcache::LogCacheClient;
use crate::uaa::UaaClient;

/// How often the predicate is evaluated.
const EVALUATION_PERIOD: Duration = Duration::from_secs(1);

/// Consecutive empty evaluations tolerated before the predicate latches
/// unhealthy.
const MAX_QUERY_FAILURES: usize = 30;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("starting canary router");

    let config = Config::from_env().context("failed to load configuration")?;

    let uaa = Arc::new(
        UaaClient::new(
            &config.uaa_addr,
            config.uaa_client.clone(),
            config.uaa_client_secret.clone(),
            config.uaa_user.clone(),
            config.uaa_password.clone(),
            config.skip_ssl_validation,
        )
        .context("failed to build the UAA client")?,
    );

    let reader = Arc::new(
        LogCacheClient::new(config.log_cache_addr.clone(), uaa, config.skip_ssl_validation)
            .context("failed to build the metric store client")?,
    );

    let predicate = MetricPredicate::spawn(
        &config.query,
        MAX_QUERY_FAILURES,
        reader,
        predicate::wall_clock_ticks(EVALUATION_PERIOD),
    )
    .context("invalid metric query")?;

    // Lifecycle events go to stdout, where the deployment tool reads them.
    let events = Arc::new(EventWriter::new(std::io::stdout()));
    let planner = Arc::new(RoutePlanner::new(
        config.plan.clone(),
        predicate.probe(),
        events,
    ));

    let proxy = SplitProxy::new(
        &config.current_route,
        &config.canary_route,
        planner,
        ProxyOptions {
            skip_tls_verify: config.skip_ssl_validation,
        },
    )
    .context("failed to build the split proxy")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, current = %config.current_route, canary = %config.canary_route, "proxying");

    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown signal received");
    };

    axum::serve(listener, proxy.router())
        .with_graceful_shutdown(shutdown)
        .await
        .context("server terminated")?;

    info!("closing canary router");
    Ok(())
}
