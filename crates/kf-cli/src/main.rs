//! kube-forward
//!
//! Forwards a local TCP port to a port of a remote pod, or of a ready pod
//! behind a service. The binary itself is plain blocking code; all
//! network work runs on the shared loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kf_bridge::run_blocking;
use kf_cli::Cli;
use kf_client::{ApiClient, HttpUpgradeNegotiator, ReadyPodResolver};
use kf_tunnel::forward_with_config;

/// How long the startup version check may take
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = cli.resolve_config()?;
    let spec = cli.forward_spec(&config)?;

    let client = ApiClient::new(&config.api).context("Failed to create API client")?;

    let checker = client.clone();
    let version = run_blocking::<_, _, anyhow::Error>(
        async move { Ok(checker.version().await?) },
        Some(VERSION_CHECK_TIMEOUT),
    );
    match version {
        Ok(version) => tracing::info!(server = %client.server(), %version, "Connected to API server"),
        Err(e) => tracing::warn!(server = %client.server(), "Version check failed: {:#}", e),
    }

    // Services are re-resolved to a ready pod on every negotiation attempt
    let resolver = Arc::new(ReadyPodResolver::new(client.clone()));
    let negotiator = Arc::new(HttpUpgradeNegotiator::new(client).with_resolver(resolver));
    let remote_port = spec.remote_port();
    let target = spec.target().clone();

    let tunnel = Arc::new(
        forward_with_config(spec, negotiator, &config)
            .with_context(|| format!("Failed to forward to {}", target))?,
    );

    for addr in tunnel.session().local_addrs() {
        println!("Forwarding from {} -> {}", addr, remote_port);
    }

    {
        let tunnel = Arc::clone(&tunnel);
        std::thread::Builder::new()
            .name("kf-signal".to_string())
            .spawn(move || {
                let interrupted = run_blocking::<_, _, anyhow::Error>(
                    async { Ok(tokio::signal::ctrl_c().await?) },
                    None,
                );
                if let Err(e) = interrupted {
                    tracing::warn!("Failed to wait for Ctrl-C: {:#}", e);
                    return;
                }
                tracing::info!("Interrupted, stopping");
                tunnel.stop();
            })
            .context("Failed to spawn signal thread")?;
    }

    tunnel
        .run_forever()
        .with_context(|| format!("Forward to {} failed", target))?;

    tracing::info!("Forward stopped");
    Ok(())
}
