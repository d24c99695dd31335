//! HTTP ingress tests
//!
//! Drives the ingress route against an in-process control channel: a fake
//! client drains the channel's send queue and answers frames the way the
//! real relay would.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use tunlify_catalog::{
    generate_connection_token, CatalogStore, MemoryCatalog, NewTunnel, ServiceType, Tunnel,
    TunnelProtocol, TunnelStatus,
};
use tunlify_gateway::channel::ControlChannel;
use tunlify_gateway::{router, ws, AppState, GatewayConfig};
use tunlify_proto::ControlMessage;

async fn seeded_state(request_timeout: Duration) -> (Arc<AppState>, Tunnel) {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog
        .create(NewTunnel {
            user_id: "user-1".to_string(),
            subdomain: "myapp".to_string(),
            region: "id".to_string(),
            service_type: ServiceType::Http,
            protocol: TunnelProtocol::Http,
            local_port: 3000,
            remote_port: None,
            connection_token: generate_connection_token(),
        })
        .await
        .unwrap();

    let state = AppState::new(
        catalog,
        GatewayConfig {
            base_domain: "example".to_string(),
            request_timeout,
            ..GatewayConfig::default()
        },
    );
    (state, tunnel)
}

async fn mark_connected(state: &AppState, tunnel: &Tunnel, connected: bool) {
    state
        .catalog
        .update_status(
            &tunnel.id,
            TunnelStatus::Active,
            connected,
            Some(chrono::Utc::now()),
        )
        .await
        .unwrap();
}

/// Register a control channel and run a scripted client against its queue.
fn attach_client<F>(state: &Arc<AppState>, tunnel: &Tunnel, script: F) -> Arc<ControlChannel>
where
    F: Fn(ControlMessage) -> Option<String> + Send + 'static,
{
    let (channel, mut queue_rx) = ControlChannel::new(
        tunnel.id.clone(),
        tunnel.key(),
        tunnel.user_id.clone(),
        state.config.send_queue_capacity,
    );
    state.registry.insert(channel.clone());

    let state = state.clone();
    let dispatch_channel = channel.clone();
    tokio::spawn(async move {
        while let Some(frame) = queue_rx.recv().await {
            if let Some(reply) = script(frame) {
                ws::dispatch_frame(&state, &dispatch_channel, &reply).await;
            }
        }
    });

    channel
}

fn ingress_request(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("x-tunnel-subdomain", "myapp")
        .header("x-tunnel-region", "id")
        .header("accept", "text/html")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_edge_headers_is_400() {
    let (state, _tunnel) = seeded_state(Duration::from_secs(5)).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Body::empty())
        .unwrap();

    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_tunnel_is_404() {
    let (state, _tunnel) = seeded_state(Duration::from_secs(5)).await;
    // Tunnel exists but is inactive, so find_active misses it.

    let response = router(state).oneshot(ingress_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_client_disconnected_is_503() {
    let (state, tunnel) = seeded_state(Duration::from_secs(5)).await;
    mark_connected(&state, &tunnel, false).await;

    let response = router(state).oneshot(ingress_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = json_body(response).await;
    assert_eq!(body["error"], "client_disconnected");
}

#[tokio::test]
async fn test_no_registry_entry_is_503_websocket_disconnected() {
    let (state, tunnel) = seeded_state(Duration::from_secs(5)).await;
    // The catalog says connected (e.g. state left over from before a
    // gateway restart) but this gateway holds no channel.
    mark_connected(&state, &tunnel, true).await;

    let response = router(state).oneshot(ingress_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = json_body(response).await;
    assert_eq!(body["error"], "websocket_disconnected");
    assert_eq!(body["tunnel"], "myapp.id.example");
}

#[tokio::test]
async fn test_happy_path_round_trip() {
    let (state, tunnel) = seeded_state(Duration::from_secs(5)).await;
    mark_connected(&state, &tunnel, true).await;

    let _channel = attach_client(&state, &tunnel, |frame| match frame {
        ControlMessage::Request {
            request_id,
            method,
            url,
            headers,
            ..
        } => {
            // The edge's trust headers must never reach the client.
            assert!(!headers.contains_key("x-tunnel-subdomain"));
            assert!(!headers.contains_key("x-tunnel-region"));
            assert!(!headers.contains_key("host"));
            assert_eq!(headers["accept"], "text/html");
            assert_eq!(method, "GET");
            assert_eq!(url, "/hello?q=1");

            Some(format!(
                "{{\"type\":\"response\",\"requestId\":\"{}\",\"statusCode\":200,\
                 \"headers\":{{\"content-type\":\"text/plain\",\"content-length\":\"9999\",\
                 \"server\":\"local\"}},\"encoding\":\"utf8\",\"body\":\"hello\"}}",
                request_id
            ))
        }
        _ => None,
    });

    let response = router(state.clone())
        .oneshot(ingress_request("/hello?q=1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["x-powered-by"], "Tunlify");
    assert_eq!(headers["x-tunnel-subdomain"], "myapp");
    assert_eq!(headers["x-tunnel-region"], "id");
    assert_eq!(headers["content-type"], "text/plain");
    // The frame's forged content-length was stripped; the transport set
    // the real one.
    assert_eq!(headers["content-length"], "5");
    assert!(!headers.contains_key("server"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello");

    // Correlation left nothing behind.
    assert_eq!(state.pending.count(), 0);
}

#[tokio::test]
async fn test_silent_client_times_out_with_504() {
    let (state, tunnel) = seeded_state(Duration::from_millis(200)).await;
    mark_connected(&state, &tunnel, true).await;

    // Client that never answers.
    let _channel = attach_client(&state, &tunnel, |_| None);

    let response = router(state.clone())
        .oneshot(ingress_request("/"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = json_body(response).await;
    assert_eq!(body["message"], "Gateway Timeout");
    assert_eq!(body["error"], "timeout");
    assert_eq!(body["tunnel"], "myapp.id.example");

    // The entry was removed when the timeout fired.
    assert_eq!(state.pending.count(), 0);
}

#[tokio::test]
async fn test_client_error_frame_is_502() {
    let (state, tunnel) = seeded_state(Duration::from_secs(5)).await;
    mark_connected(&state, &tunnel, true).await;

    let _channel = attach_client(&state, &tunnel, |frame| match frame {
        ControlMessage::Request { request_id, .. } => Some(format!(
            "{{\"type\":\"error\",\"requestId\":\"{}\",\
             \"message\":\"connection refused\"}}",
            request_id
        )),
        _ => None,
    });

    let response = router(state).oneshot(ingress_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = json_body(response).await;
    assert_eq!(body["error"], "bad_gateway");
}

#[tokio::test]
async fn test_base64_response_body_round_trips() {
    let (state, tunnel) = seeded_state(Duration::from_secs(5)).await;
    mark_connected(&state, &tunnel, true).await;

    let payload: Vec<u8> = vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff];
    let encoded = tunlify_proto::messages::encode_body(&payload);

    let _channel = attach_client(&state, &tunnel, move |frame| match frame {
        ControlMessage::Request { request_id, .. } => Some(format!(
            "{{\"type\":\"response\",\"requestId\":\"{}\",\"statusCode\":200,\
             \"headers\":{{\"content-type\":\"image/png\"}},\
             \"encoding\":\"base64\",\"body\":\"{}\"}}",
            request_id, encoded
        )),
        _ => None,
    });

    let response = router(state).oneshot(ingress_request("/logo.png")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.to_vec(), vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff]);
}

#[tokio::test]
async fn test_channel_close_fails_inflight_requests() {
    let (state, tunnel) = seeded_state(Duration::from_secs(5)).await;
    mark_connected(&state, &tunnel, true).await;

    // Client that swallows requests; we close the channel mid-flight.
    let channel = attach_client(&state, &tunnel, |_| None);

    let app = router(state.clone());
    let in_flight = tokio::spawn(async move { app.oneshot(ingress_request("/")).await.unwrap() });

    // Give the request time to register, then simulate the disconnect
    // broadcast: cancel everything keyed to this tunnel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.pending.count(), 1);
    state.pending.cancel_by_key(&channel.key);

    let response = in_flight.await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = json_body(response).await;
    assert_eq!(body["error"], "tunnel_gone");
    assert_eq!(state.pending.count(), 0);
}
