//! HTTP ingress
//!
//! The edge proxy forwards all wildcard-subdomain traffic here with
//! `X-Tunnel-Subdomain` and `X-Tunnel-Region` injected (those two headers
//! are the only client-supplied data we trust). Each request becomes one
//! `request` frame on the tunnel's control channel; correlation back to
//! this handler is purely by request id.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;
use uuid::Uuid;

use tunlify_catalog::{validate, CatalogError, CatalogStore, FieldError, TunnelKey};
use tunlify_proto::{encode_body, flatten_header_map, sanitize_wire_headers, ControlMessage};

use crate::channel::SendError;
use crate::error::GatewayError;
use crate::pending::{ProxiedResponse, RequestFailure};
use crate::AppState;

pub async fn ingress_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match proxy_request(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_request(state: &AppState, request: Request) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();

    let key = tunnel_key_from_headers(&parts.headers)?;
    let host = key.hostname(&state.config.base_domain);

    let tunnel = state
        .catalog
        .find_active(&key.subdomain, &key.region)
        .await
        .map_err(|err| match err {
            CatalogError::NotFound => {
                GatewayError::NotFound(format!("no active tunnel for {}", host))
            }
            other => other.into(),
        })?;

    if !tunnel.client_connected {
        return Err(GatewayError::ClientDisconnected {
            tunnel: host.clone(),
        });
    }

    // The catalog row can say connected while this gateway has no channel,
    // e.g. right after a restart. Distinct error so operators can tell the
    // two states apart.
    let channel = state
        .registry
        .lookup(&key)
        .ok_or_else(|| GatewayError::WebSocketDisconnected {
            tunnel: host.clone(),
        })?;

    let request_id = Uuid::new_v4().to_string();
    let method = parts.method.clone();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = flatten_header_map(&parts.headers);

    let body = if matches!(method, Method::GET | Method::HEAD) {
        None
    } else {
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to read body: {}", err)))?;
        if bytes.is_empty() {
            None
        } else {
            Some(encode_body(&bytes))
        }
    };

    debug!(
        request_id = %request_id,
        tunnel = %key,
        method = %method,
        url = %url,
        "forwarding request over control channel"
    );

    // Register before sending so a response can never beat the waiter.
    let receiver = state
        .pending
        .register(&request_id, key.clone(), method.as_str(), &url);
    channel.note_request_sent();

    let frame = ControlMessage::Request {
        request_id: request_id.clone(),
        method: method.as_str().to_string(),
        url,
        headers,
        body,
    };

    if let Err(err) = channel.try_send(frame) {
        state.pending.fail(&request_id, RequestFailure::TunnelGone);
        return Err(match err {
            SendError::QueueFull => GatewayError::Busy { tunnel: host },
            SendError::Closed => GatewayError::WebSocketDisconnected { tunnel: host },
        });
    }

    let outcome = match tokio::time::timeout(state.config.request_timeout, receiver).await {
        Ok(Ok(outcome)) => outcome,
        // The sender vanished without completing; treat as the channel
        // going away.
        Ok(Err(_)) => Err(RequestFailure::TunnelGone),
        Err(_elapsed) => {
            state.pending.fail(&request_id, RequestFailure::Timeout);
            Err(RequestFailure::Timeout)
        }
    };

    match outcome {
        Ok(response) => build_response(&key, response),
        Err(RequestFailure::Timeout) => Err(GatewayError::Timeout { tunnel: host }),
        Err(RequestFailure::TunnelGone) => Err(GatewayError::TunnelGone { tunnel: host }),
        Err(RequestFailure::Upstream(message)) => Err(GatewayError::BadGateway {
            tunnel: host,
            message,
        }),
    }
}

fn tunnel_key_from_headers(headers: &HeaderMap) -> Result<TunnelKey, GatewayError> {
    let mut errors = Vec::new();

    let subdomain = header_value(headers, "x-tunnel-subdomain");
    match subdomain {
        Some(ref value) if validate::subdomain_is_valid(value) => {}
        _ => errors.push(FieldError {
            path: "x-tunnel-subdomain".to_string(),
            msg: "missing or malformed".to_string(),
        }),
    }

    let region = header_value(headers, "x-tunnel-region");
    match region {
        Some(ref value) if validate::region_is_valid(value) => {}
        _ => errors.push(FieldError {
            path: "x-tunnel-region".to_string(),
            msg: "missing or malformed".to_string(),
        }),
    }

    if !errors.is_empty() {
        return Err(GatewayError::Validation(errors));
    }

    Ok(TunnelKey::new(
        subdomain.expect("validated"),
        region.expect("validated"),
    ))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

/// Translate a `response` frame into the HTTP response written to the edge.
fn build_response(key: &TunnelKey, frame: ProxiedResponse) -> Result<Response, GatewayError> {
    let status = frame
        .status_code
        .filter(|code| (100..=599).contains(code))
        .unwrap_or(200);

    let body = frame.encoding.decode(&frame.body).map_err(|err| {
        GatewayError::BadGateway {
            tunnel: key.to_string(),
            message: format!("undecodable response body: {}", err),
        }
    })?;

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));

    for (name, value) in sanitize_wire_headers(&frame.headers) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder = builder
        .header("x-tunnel-subdomain", &key.subdomain)
        .header("x-tunnel-region", &key.region)
        .header("x-powered-by", "Tunlify");

    builder
        .body(Body::from(body))
        .map_err(|err| GatewayError::Internal(err.to_string()))
}
