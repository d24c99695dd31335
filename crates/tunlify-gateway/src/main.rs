//! Gateway binary

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tunlify_catalog::MemoryCatalog;
use tunlify_gateway::{janitor, router, AppState, GatewayConfig};

#[derive(Debug, Parser)]
#[command(name = "tunlify-gateway", about = "Tunlify tunnel gateway")]
struct Args {
    /// Address for the HTTP listener (ingress, control channel, REST).
    #[arg(long, env = "TUNLIFY_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Base domain public hostnames live under.
    #[arg(long, env = "TUNLIFY_BASE_DOMAIN", default_value = "tunlify.net")]
    base_domain: String,

    /// Address TCP/UDP tunnel listeners bind on.
    #[arg(long, env = "TUNLIFY_L4_BIND_IP", default_value = "0.0.0.0")]
    l4_bind_ip: IpAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = GatewayConfig {
        base_domain: args.base_domain,
        l4_bind_ip: args.l4_bind_ip,
        ..GatewayConfig::default()
    };

    let catalog = Arc::new(MemoryCatalog::new());
    let state = AppState::new(catalog, config);

    janitor::spawn_janitor(state.clone());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "gateway listening");

    axum::serve(listener, router(state))
        .await
        .context("server error")?;

    Ok(())
}
