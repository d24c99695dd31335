//! Client binary

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunlify_client::{ClientRelay, LocalTarget, RelayConfig, RelayMode, TargetScheme};

#[derive(Debug, Parser)]
#[command(name = "tunlify-client", about = "Expose a local service through Tunlify")]
struct Args {
    /// Connection token issued when the tunnel was created.
    #[arg(long, env = "TUNLIFY_TOKEN")]
    token: String,

    /// Gateway control endpoint.
    #[arg(long, env = "TUNLIFY_SERVER", default_value = "wss://api.tunlify.net")]
    server: String,

    /// Local target: `host:port`, `:port`, `port`, or an http(s):// URL.
    #[arg(long, env = "TUNLIFY_LOCAL")]
    local: String,

    /// Tunnel protocol this relay serves.
    #[arg(long, value_enum, default_value = "http")]
    mode: RelayMode,

    /// Skip the local reachability check before connecting.
    #[arg(long)]
    skip_preflight: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let target = LocalTarget::parse(&args.local, args.mode.default_target_scheme())
        .with_context(|| format!("invalid --local value '{}'", args.local))?;

    // The relay dials plain http/1.1; an https target would be silently
    // downgraded, so refuse it up front.
    if args.mode == RelayMode::Http && target.scheme == TargetScheme::Https {
        anyhow::bail!(
            "https local targets are not supported; point --local at the plain-http port"
        );
    }

    let relay = ClientRelay::new(RelayConfig {
        server_url: args.server,
        connection_token: args.token,
        target: target.clone(),
        mode: args.mode,
        reconnect_delay: Duration::from_secs(5),
        udp_session_window: Duration::from_secs(60),
    });

    if args.skip_preflight {
        info!(target = %target, "skipping pre-flight check");
    } else if let Err(err) = relay.preflight().await {
        // The tunnel can still come up later; warn and keep going.
        warn!(%err, target = %target, "local endpoint not reachable yet");
    } else {
        info!(target = %target, "local endpoint reachable");
    }

    relay.run().await.context("relay stopped")?;
    Ok(())
}
