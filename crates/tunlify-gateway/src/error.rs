//! Gateway error kinds and their single translation to HTTP
//!
//! Errors bubble from wherever they originate to the ingress or REST
//! boundary, where they are converted exactly once into a status code plus
//! a JSON body `{message, error?, tunnel?}` (validation failures carry the
//! `[{path, msg}]` array instead).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use tunlify_catalog::{CatalogError, FieldError, PortAllocError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("tunnel client is not connected")]
    ClientDisconnected { tunnel: String },

    #[error("no control channel registered on this gateway")]
    WebSocketDisconnected { tunnel: String },

    #[error("tunnel send queue is saturated")]
    Busy { tunnel: String },

    #[error("request timed out")]
    Timeout { tunnel: String },

    #[error("tunnel client failed the request: {message}")]
    BadGateway { tunnel: String, message: String },

    #[error("control channel closed while the request was in flight")]
    TunnelGone { tunnel: String },

    #[error("no free port available in the allocation range")]
    PortSpaceExhausted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::ClientDisconnected { .. }
            | GatewayError::WebSocketDisconnected { .. }
            | GatewayError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway { .. } | GatewayError::TunnelGone { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::PortSpaceExhausted | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the JSON body's `error` field.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            GatewayError::Validation(_) => None,
            GatewayError::Unauthorized => Some("unauthorized"),
            GatewayError::NotFound(_) => Some("not_found"),
            GatewayError::Conflict(_) => Some("conflict"),
            GatewayError::ClientDisconnected { .. } => Some("client_disconnected"),
            GatewayError::WebSocketDisconnected { .. } => Some("websocket_disconnected"),
            GatewayError::Busy { .. } => Some("tunnel_busy"),
            GatewayError::Timeout { .. } => Some("timeout"),
            GatewayError::BadGateway { .. } => Some("bad_gateway"),
            GatewayError::TunnelGone { .. } => Some("tunnel_gone"),
            GatewayError::PortSpaceExhausted => Some("exhausted_port_space"),
            GatewayError::Internal(_) => Some("internal"),
        }
    }

    /// Human message for the JSON body.
    pub fn message(&self) -> String {
        match self {
            GatewayError::Timeout { .. } => "Gateway Timeout".to_string(),
            GatewayError::BadGateway { .. } | GatewayError::TunnelGone { .. } => {
                "Bad Gateway".to_string()
            }
            GatewayError::ClientDisconnected { .. } => {
                "Tunnel exists but its client is not connected. \
                 Start the tunlify client with your connection token to bring it online."
                    .to_string()
            }
            other => other.to_string(),
        }
    }

    fn tunnel(&self) -> Option<&str> {
        match self {
            GatewayError::ClientDisconnected { tunnel }
            | GatewayError::WebSocketDisconnected { tunnel }
            | GatewayError::Busy { tunnel }
            | GatewayError::Timeout { tunnel }
            | GatewayError::BadGateway { tunnel, .. }
            | GatewayError::TunnelGone { tunnel } => Some(tunnel),
            _ => None,
        }
    }
}

impl From<CatalogError> for GatewayError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound => GatewayError::NotFound("tunnel not found".to_string()),
            conflict @ (CatalogError::SubdomainTaken { .. } | CatalogError::PortTaken { .. }) => {
                GatewayError::Conflict(conflict.to_string())
            }
            CatalogError::TokenTaken => {
                GatewayError::Internal("connection token collision".to_string())
            }
            CatalogError::Storage(msg) => GatewayError::Internal(msg),
        }
    }
}

impl From<PortAllocError> for GatewayError {
    fn from(err: PortAllocError) -> Self {
        match err {
            taken @ PortAllocError::Taken { .. } => GatewayError::Conflict(taken.to_string()),
            PortAllocError::Exhausted => GatewayError::PortSpaceExhausted,
            PortAllocError::Catalog(inner) => inner.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel: Option<String>,
}

#[derive(Serialize)]
struct ValidationBody {
    message: String,
    errors: Vec<FieldError>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            GatewayError::Validation(errors) => {
                let body = ValidationBody {
                    message: "Validation failed".to_string(),
                    errors,
                };
                (status, Json(body)).into_response()
            }
            other => {
                let body = ErrorBody {
                    message: other.message(),
                    error: other.code(),
                    tunnel: other.tunnel().map(str::to_string),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}
