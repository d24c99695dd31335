//! In-memory catalog implementation
//!
//! All rows live in one map guarded by a mutex; the uniqueness invariants
//! are checked and the row inserted under a single lock acquisition, which
//! gives `create` its atomicity. Data does not survive a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::{CatalogError, CatalogStore, NewTunnel};
use crate::tunnel::{Tunnel, TunnelStatus};

#[derive(Default)]
pub struct MemoryCatalog {
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tunnel>> {
        // A poisoned lock means a panic mid-mutation; the map itself is
        // still structurally sound, so recover the guard.
        self.tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn find_by_token(&self, token: &str) -> Result<Tunnel, CatalogError> {
        self.lock()
            .values()
            .find(|t| t.connection_token == token)
            .cloned()
            .ok_or(CatalogError::NotFound)
    }

    async fn find_active(&self, subdomain: &str, region: &str) -> Result<Tunnel, CatalogError> {
        self.lock()
            .values()
            .find(|t| {
                t.subdomain == subdomain
                    && t.region == region
                    && t.status == TunnelStatus::Active
            })
            .cloned()
            .ok_or(CatalogError::NotFound)
    }

    async fn create(&self, fields: NewTunnel) -> Result<Tunnel, CatalogError> {
        let mut tunnels = self.lock();

        for existing in tunnels.values() {
            if existing.subdomain == fields.subdomain && existing.region == fields.region {
                return Err(CatalogError::SubdomainTaken {
                    subdomain: fields.subdomain,
                    region: fields.region,
                });
            }
            if let (Some(port), Some(existing_port)) = (fields.remote_port, existing.remote_port) {
                if existing.region == fields.region && existing_port == port {
                    return Err(CatalogError::PortTaken {
                        region: fields.region,
                        port,
                    });
                }
            }
            if existing.connection_token == fields.connection_token {
                return Err(CatalogError::TokenTaken);
            }
        }

        let tunnel = Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: fields.user_id,
            subdomain: fields.subdomain,
            region: fields.region,
            service_type: fields.service_type,
            protocol: fields.protocol,
            local_port: fields.local_port,
            remote_port: fields.remote_port,
            connection_token: fields.connection_token,
            status: TunnelStatus::Inactive,
            client_connected: false,
            last_connected: None,
            created_at: Utc::now(),
        };

        tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(tunnel)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Tunnel>, CatalogError> {
        let mut tunnels: Vec<Tunnel> = self
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tunnels)
    }

    async fn delete(&self, id: &str, user_id: &str) -> Result<Tunnel, CatalogError> {
        let mut tunnels = self.lock();
        let owned = tunnels
            .get(id)
            .map(|tunnel| tunnel.user_id == user_id)
            .unwrap_or(false);
        if !owned {
            return Err(CatalogError::NotFound);
        }
        tunnels.remove(id).ok_or(CatalogError::NotFound)
    }

    async fn update_status(
        &self,
        id: &str,
        status: TunnelStatus,
        client_connected: bool,
        last_connected: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError> {
        let mut tunnels = self.lock();
        let tunnel = tunnels.get_mut(id).ok_or(CatalogError::NotFound)?;
        tunnel.status = status;
        tunnel.client_connected = client_connected;
        if last_connected.is_some() {
            tunnel.last_connected = last_connected;
        }
        Ok(())
    }

    async fn is_port_free(&self, region: &str, port: u16) -> Result<bool, CatalogError> {
        Ok(!self
            .lock()
            .values()
            .any(|t| t.region == region && t.remote_port == Some(port)))
    }
}
