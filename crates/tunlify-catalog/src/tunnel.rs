//! Tunnel model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::presets::ServiceType;

/// Transport protocol of a tunnel's public side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
    Udp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(TunnelProtocol::Http),
            "tcp" => Some(TunnelProtocol::Tcp),
            "udp" => Some(TunnelProtocol::Udp),
            _ => None,
        }
    }
}

/// Lifecycle status of a tunnel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Inactive,
    Active,
}

/// `(subdomain, region)` — the lookup key the HTTP ingress resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelKey {
    pub subdomain: String,
    pub region: String,
}

impl TunnelKey {
    pub fn new(subdomain: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            region: region.into(),
        }
    }

    /// Public hostname under the given base domain.
    pub fn hostname(&self, base_domain: &str) -> String {
        format!("{}.{}.{}", self.subdomain, self.region, base_domain)
    }
}

impl std::fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.subdomain, self.region)
    }
}

/// A durable tunnel row.
///
/// Invariants (enforced by the store): `(subdomain, region)` unique;
/// `(region, remote_port)` unique among rows with a port;
/// `connection_token` globally unique; `remote_port` is `None` iff
/// `protocol` is `Http`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub user_id: String,
    pub subdomain: String,
    pub region: String,
    pub service_type: ServiceType,
    pub protocol: TunnelProtocol,
    /// Advisory only; the client decides what it actually dials.
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub connection_token: String,
    pub status: TunnelStatus,
    pub client_connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.subdomain.clone(), self.region.clone())
    }
}

/// Generate a fresh connection token: 32 random bytes, hex-encoded.
pub fn generate_connection_token() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
