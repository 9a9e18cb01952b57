use std::net::SocketAddr;

use anyhow::{Context, Result};
use depot_service::config::Config;
use depot_service::metric;
use depot_service::services::create_services;

use crate::endpoints;

/// Creates all services and serves them over HTTP based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("depot-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let services = create_services(&config).context("failed to create services")?;
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    let server =
        axum_server::bind(socket).serve(endpoints::create_app(services).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
