//! Management REST surface
//!
//! Consumed by the dashboard. Caller identity arrives as the `X-User-Id`
//! header injected by the upstream account layer; like the `X-Tunnel-*`
//! ingress headers it is authoritative because only trusted proxies can
//! reach this listener.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use tunlify_catalog::{
    allocate_remote_port, generate_connection_token, validate, CatalogError, CatalogStore,
    NewTunnel, RawNewTunnel, Tunnel, TunnelProtocol, TunnelStatus,
};

use crate::channel::CloseReason;
use crate::error::GatewayError;
use crate::AppState;

/// Caller identity extracted from `X-User-Id`.
pub struct UserId(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or(GatewayError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub subdomain: String,
    pub location: String,
    pub service_type: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub local_port: Option<u32>,
    #[serde(default)]
    pub remote_port: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TunnelInfo {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    pub tunnel_url: String,
    pub connection_info: String,
    pub service_info: ServiceInfo,
}

#[derive(Debug, Serialize)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct CreateTunnelResponse {
    pub message: &'static str,
    pub tunnel: TunnelInfo,
    pub setup_instructions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusPatch {
    pub status: TunnelStatus,
    #[serde(default)]
    pub client_connected: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub connection_token: String,
}

#[derive(Debug, Serialize)]
pub struct PresetEntry {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub default_port: Option<u16>,
    pub protocol: &'static str,
}

fn tunnel_info(state: &AppState, tunnel: Tunnel) -> TunnelInfo {
    let tunnel_url = state.public_url(&tunnel);
    let host = tunnel.key().hostname(&state.config.base_domain);

    let connection_info = match (tunnel.protocol, tunnel.remote_port) {
        (TunnelProtocol::Http, _) => tunnel_url.clone(),
        (_, Some(port)) => format!("{}:{}", host, port),
        (_, None) => host,
    };

    let service_info = ServiceInfo {
        name: tunnel.service_type.display_name(),
        description: tunnel.service_type.description(),
    };

    TunnelInfo {
        tunnel,
        tunnel_url,
        connection_info,
        service_info,
    }
}

pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<Json<TunnelList>, GatewayError> {
    let tunnels = state.catalog.list(&user_id).await?;
    let tunnels: Vec<TunnelInfo> = tunnels
        .into_iter()
        .map(|tunnel| tunnel_info(&state, tunnel))
        .collect();
    let total = tunnels.len();

    Ok(Json(TunnelList { tunnels, total }))
}

pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Json(request): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<CreateTunnelResponse>), GatewayError> {
    let raw = RawNewTunnel {
        subdomain: &request.subdomain,
        region: &request.location,
        service_type: &request.service_type,
        protocol: request.protocol.as_deref(),
        local_port: request.local_port,
        remote_port: request.remote_port,
    };
    let valid = validate::validate_new_tunnel(&raw).map_err(GatewayError::Validation)?;

    let requested_port = valid.remote_port;
    let mut attempts = 0;
    let tunnel = loop {
        attempts += 1;

        let remote_port = match valid.protocol {
            TunnelProtocol::Http => None,
            _ => Some(
                allocate_remote_port(state.catalog.as_ref(), &valid.region, requested_port)
                    .await?,
            ),
        };

        let fields = NewTunnel {
            user_id: user_id.clone(),
            subdomain: valid.subdomain.clone(),
            region: valid.region.clone(),
            service_type: valid.service_type,
            protocol: valid.protocol,
            local_port: valid.local_port,
            remote_port,
            connection_token: generate_connection_token(),
        };

        match state.catalog.create(fields).await {
            Ok(tunnel) => break tunnel,
            // A concurrent create can win the randomly probed port between
            // our probe and the insert; allocate again.
            Err(CatalogError::PortTaken { .. }) if requested_port.is_none() && attempts < 3 => {
                continue;
            }
            Err(CatalogError::TokenTaken) if attempts < 3 => continue,
            Err(err) => return Err(err.into()),
        }
    };

    info!(
        tunnel_id = %tunnel.id,
        user_id = %user_id,
        subdomain = %tunnel.subdomain,
        region = %tunnel.region,
        protocol = tunnel.protocol.as_str(),
        remote_port = ?tunnel.remote_port,
        "tunnel created"
    );

    let token = tunnel.connection_token.clone();
    let info = tunnel_info(&state, tunnel);
    let setup_instructions = vec![
        format!(
            "Run the client next to your service: tunlify-client --token {} --local {}",
            token, info.tunnel.local_port
        ),
        format!("Your public endpoint: {}", info.connection_info),
    ];

    Ok((
        StatusCode::CREATED,
        Json(CreateTunnelResponse {
            message: "Tunnel created",
            tunnel: info,
            setup_instructions,
        }),
    ))
}

pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    let deleted = state.catalog.delete(&id, &user_id).await?;

    // Deleting a tunnel whose control channel is open also closes the
    // channel; its session cleanup handles the rest.
    if let Some(channel) = state.registry.lookup(&deleted.key()) {
        if channel.tunnel_id == deleted.id {
            channel.close(CloseReason::Deleted);
        }
    }

    info!(tunnel_id = %id, user_id = %user_id, "tunnel deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn patch_status(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(patch): Json<StatusPatch>,
) -> Result<StatusCode, GatewayError> {
    let owned = state.catalog.list(&user_id).await?;
    let current = owned
        .into_iter()
        .find(|tunnel| tunnel.id == id)
        .ok_or_else(|| GatewayError::NotFound("tunnel not found".to_string()))?;

    let client_connected = patch.client_connected.unwrap_or(current.client_connected);
    state
        .catalog
        .update_status(&id, patch.status, client_connected, None)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn auth_by_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<TunnelInfo>, GatewayError> {
    if !validate::token_is_valid(&request.connection_token) {
        return Err(GatewayError::Validation(vec![tunlify_catalog::FieldError {
            path: "connection_token".to_string(),
            msg: "must be 32-64 characters".to_string(),
        }]));
    }

    let tunnel = state
        .catalog
        .find_by_token(&request.connection_token)
        .await
        .map_err(|err| match err {
            CatalogError::NotFound => GatewayError::Unauthorized,
            other => other.into(),
        })?;

    Ok(Json(tunnel_info(&state, tunnel)))
}

pub async fn list_presets() -> Json<Vec<PresetEntry>> {
    let presets = tunlify_catalog::ServiceType::ALL
        .iter()
        .map(|ty| PresetEntry {
            key: ty.as_str(),
            name: ty.display_name(),
            description: ty.description(),
            default_port: ty.default_port(),
            protocol: ty.default_protocol().as_str(),
        })
        .collect();
    Json(presets)
}
