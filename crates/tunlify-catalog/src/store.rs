//! Catalog store trait
//!
//! The narrow interface every other component consumes. `create` is atomic
//! with respect to the uniqueness invariants; on conflict it names the
//! conflicting field and never leaves a partial row behind. All other
//! operations are row-local.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::presets::ServiceType;
use crate::tunnel::{Tunnel, TunnelProtocol, TunnelStatus};

/// Errors surfaced by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("tunnel not found")]
    NotFound,

    #[error("subdomain '{subdomain}' is already taken in region '{region}'")]
    SubdomainTaken { subdomain: String, region: String },

    #[error("port {port} is already taken in region '{region}'")]
    PortTaken { region: String, port: u16 },

    #[error("connection token already exists")]
    TokenTaken,

    #[error("storage error: {0}")]
    Storage(String),
}

/// Fields for creating a tunnel row. The store assigns `id`, `status`,
/// `client_connected` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub user_id: String,
    pub subdomain: String,
    pub region: String,
    pub service_type: ServiceType,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub connection_token: String,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Resolve a connection token to its tunnel.
    async fn find_by_token(&self, token: &str) -> Result<Tunnel, CatalogError>;

    /// Resolve a tunnel key; only rows with `status = Active` match.
    async fn find_active(&self, subdomain: &str, region: &str) -> Result<Tunnel, CatalogError>;

    /// Insert a new tunnel, enforcing the uniqueness invariants atomically.
    async fn create(&self, fields: NewTunnel) -> Result<Tunnel, CatalogError>;

    /// All tunnels owned by a user.
    async fn list(&self, user_id: &str) -> Result<Vec<Tunnel>, CatalogError>;

    /// Delete a tunnel owned by the caller; returns the removed row.
    async fn delete(&self, id: &str, user_id: &str) -> Result<Tunnel, CatalogError>;

    /// Update connection state for a tunnel row.
    async fn update_status(
        &self,
        id: &str,
        status: TunnelStatus,
        client_connected: bool,
        last_connected: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError>;

    /// Whether `(region, port)` is unclaimed.
    async fn is_port_free(&self, region: &str, port: u16) -> Result<bool, CatalogError>;
}
