//! Gateway configuration

use std::net::IpAddr;
use std::time::Duration;

/// Tunables for one gateway instance. Constructed once at startup and
/// injected; nothing reads configuration ambiently.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base domain under which public hostnames live
    /// (`{subdomain}.{region}.{base_domain}`).
    pub base_domain: String,
    /// Address TCP/UDP tunnel listeners bind on.
    pub l4_bind_ip: IpAddr,
    /// Server-initiated heartbeat cadence (must stay below 30s).
    pub heartbeat_interval: Duration,
    /// Budget for one proxied HTTP request.
    pub request_timeout: Duration,
    /// How long the TCP ingress waits for `tcp_connect_ack`.
    pub connect_ack_timeout: Duration,
    /// UDP session reuse window.
    pub udp_session_timeout: Duration,
    /// Janitor cadence.
    pub janitor_interval: Duration,
    /// A channel with no inbound activity for this long is evicted.
    pub stale_channel_after: Duration,
    /// Pending requests older than this are forcibly failed.
    pub pending_max_age: Duration,
    /// Bounded per-channel send queue depth.
    pub send_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_domain: "tunlify.net".to_string(),
            l4_bind_ip: IpAddr::from([0, 0, 0, 0]),
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
            connect_ack_timeout: Duration::from_secs(10),
            udp_session_timeout: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(120),
            stale_channel_after: Duration::from_secs(300),
            pending_max_age: Duration::from_secs(120),
            send_queue_capacity: 256,
        }
    }
}
