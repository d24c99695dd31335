//! Tunlify gateway
//!
//! The public side of the tunnel service: terminates edge-forwarded HTTP
//! on wildcard hostnames and raw TCP/UDP on allocated ports, and relays
//! everything over per-client control channels. All shared state is
//! constructed once here and injected; the components never reach for
//! process globals.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod http_ingress;
pub mod janitor;
pub mod pending;
pub mod registry;
pub mod tcp_ingress;
pub mod udp_ingress;
pub mod ws;

use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::Router;

use tunlify_catalog::{CatalogStore, Tunnel, TunnelProtocol};
use tunlify_proto::CONTROL_PATH;

pub use config::GatewayConfig;
pub use error::GatewayError;

use pending::PendingRequests;
use registry::ConnectionRegistry;

/// Everything the handlers share. One instance per gateway process.
pub struct AppState {
    pub catalog: Arc<dyn CatalogStore>,
    pub registry: ConnectionRegistry,
    pub pending: PendingRequests,
    pub config: GatewayConfig,
}

impl AppState {
    pub fn new(catalog: Arc<dyn CatalogStore>, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            registry: ConnectionRegistry::new(),
            pending: PendingRequests::new(),
            config,
        })
    }

    /// The public URL for a tunnel under this gateway's base domain.
    pub fn public_url(&self, tunnel: &Tunnel) -> String {
        let host = tunnel.key().hostname(&self.config.base_domain);
        match (tunnel.protocol, tunnel.remote_port) {
            (TunnelProtocol::Http, _) => format!("https://{}", host),
            (protocol, Some(port)) => format!("{}://{}:{}", protocol.as_str(), host, port),
            (protocol, None) => format!("{}://{}", protocol.as_str(), host),
        }
    }
}

/// The gateway router: management REST, the control-channel upgrade, and
/// the catch-all ingress route the edge proxy forwards into.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tunnels", get(api::list_tunnels).post(api::create_tunnel))
        .route("/tunnels/presets", get(api::list_presets))
        .route("/tunnels/auth", post(api::auth_by_token))
        .route("/tunnels/:id", delete(api::delete_tunnel))
        .route("/tunnels/:id/status", patch(api::patch_status))
        .route(CONTROL_PATH, get(ws::control_channel_handler))
        .fallback(http_ingress::ingress_handler)
        .with_state(state)
}
