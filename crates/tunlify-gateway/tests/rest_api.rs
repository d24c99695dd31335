//! Management REST surface tests

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use tunlify_catalog::MemoryCatalog;
use tunlify_gateway::{router, AppState, GatewayConfig};

fn test_state() -> Arc<AppState> {
    AppState::new(
        Arc::new(MemoryCatalog::new()),
        GatewayConfig {
            base_domain: "example".to_string(),
            ..GatewayConfig::default()
        },
    )
}

fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_presets_catalog() {
    let app = router(test_state());

    let response = app
        .oneshot(request(Method::GET, "/tunnels/presets", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let presets = json_body(response).await;
    let presets = presets.as_array().unwrap();
    assert_eq!(presets.len(), 16);

    let ssh = presets.iter().find(|p| p["key"] == "ssh").unwrap();
    assert_eq!(ssh["default_port"], 22);
    assert_eq!(ssh["protocol"], "tcp");

    let http = presets.iter().find(|p| p["key"] == "http").unwrap();
    assert_eq!(http["protocol"], "http");

    let custom = presets.iter().find(|p| p["key"] == "custom").unwrap();
    assert!(custom["default_port"].is_null());
}

#[tokio::test]
async fn test_create_requires_identity() {
    let app = router(test_state());

    let response = app
        .oneshot(request(
            Method::POST,
            "/tunnels",
            None,
            Some(json!({"subdomain": "myapp", "location": "id", "service_type": "http"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_http_tunnel() {
    let state = test_state();
    let app = router(state.clone());

    let response = app
        .oneshot(request(
            Method::POST,
            "/tunnels",
            Some("user-1"),
            Some(json!({"subdomain": "myapp", "location": "id", "service_type": "http"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;

    let tunnel = &body["tunnel"];
    assert_eq!(tunnel["subdomain"], "myapp");
    assert_eq!(tunnel["region"], "id");
    assert_eq!(tunnel["protocol"], "http");
    assert_eq!(tunnel["status"], "inactive");
    assert_eq!(tunnel["remote_port"], Value::Null);
    assert_eq!(tunnel["tunnel_url"], "https://myapp.id.example");
    assert_eq!(tunnel["connection_token"].as_str().unwrap().len(), 64);
    assert!(!body["setup_instructions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_validation_failure_reports_paths() {
    let app = router(test_state());

    let response = app
        .oneshot(request(
            Method::POST,
            "/tunnels",
            Some("user-1"),
            Some(json!({"subdomain": "No", "location": "x", "service_type": "gopher"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    let errors = body["errors"].as_array().unwrap();
    assert!(errors.iter().all(|e| e["path"].is_string() && e["msg"].is_string()));
    assert!(errors.iter().any(|e| e["path"] == "subdomain"));
}

#[tokio::test]
async fn test_port_conflict_is_409_naming_the_port() {
    let state = test_state();

    let first = request(
        Method::POST,
        "/tunnels",
        Some("user-1"),
        Some(json!({
            "subdomain": "shell", "location": "id",
            "service_type": "ssh", "remote_port": 13000
        })),
    );
    let response = router(state.clone()).oneshot(first).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let second = request(
        Method::POST,
        "/tunnels",
        Some("user-2"),
        Some(json!({
            "subdomain": "other", "location": "id",
            "service_type": "ssh", "remote_port": 13000
        })),
    );
    let response = router(state.clone()).oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = json_body(response).await;
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("13000"));
    assert!(message.contains("id"));

    // Without remote_port the allocator finds a free port in range.
    let third = request(
        Method::POST,
        "/tunnels",
        Some("user-2"),
        Some(json!({
            "subdomain": "other", "location": "id", "service_type": "ssh"
        })),
    );
    let response = router(state).oneshot(third).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    let port = body["tunnel"]["remote_port"].as_u64().unwrap();
    assert!((10000..=60000).contains(&port));
}

#[tokio::test]
async fn test_subdomain_conflict_is_409() {
    let state = test_state();

    let create = || {
        request(
            Method::POST,
            "/tunnels",
            Some("user-1"),
            Some(json!({"subdomain": "myapp", "location": "id", "service_type": "http"})),
        )
    };

    let response = router(state.clone()).oneshot(create()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router(state).oneshot(create()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_delete_then_404() {
    let state = test_state();

    let response = router(state.clone())
        .oneshot(request(
            Method::POST,
            "/tunnels",
            Some("user-1"),
            Some(json!({"subdomain": "myapp", "location": "id", "service_type": "http"})),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    let id = body["tunnel"]["id"].as_str().unwrap().to_string();

    let response = router(state.clone())
        .oneshot(request(
            Method::DELETE,
            &format!("/tunnels/{}", id),
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Idempotence: the second delete finds nothing.
    let response = router(state)
        .oneshot(request(
            Method::DELETE,
            &format!("/tunnels/{}", id),
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_auth_by_token() {
    let state = test_state();

    let response = router(state.clone())
        .oneshot(request(
            Method::POST,
            "/tunnels",
            Some("user-1"),
            Some(json!({"subdomain": "myapp", "location": "id", "service_type": "http"})),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    let token = body["tunnel"]["connection_token"].as_str().unwrap().to_string();

    let response = router(state.clone())
        .oneshot(request(
            Method::POST,
            "/tunnels/auth",
            None,
            Some(json!({"connection_token": token})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["subdomain"], "myapp");

    // Well-formed but unknown token.
    let response = router(state.clone())
        .oneshot(request(
            Method::POST,
            "/tunnels/auth",
            None,
            Some(json!({"connection_token": "f".repeat(64)})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Malformed token shape.
    let response = router(state)
        .oneshot(request(
            Method::POST,
            "/tunnels/auth",
            None,
            Some(json!({"connection_token": "short"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_is_owner_scoped() {
    let state = test_state();

    for (user, subdomain) in [("user-1", "app-one"), ("user-1", "app-two"), ("user-2", "app-three")]
    {
        let response = router(state.clone())
            .oneshot(request(
                Method::POST,
                "/tunnels",
                Some(user),
                Some(json!({"subdomain": subdomain, "location": "id", "service_type": "http"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = router(state)
        .oneshot(request(Method::GET, "/tunnels", Some("user-1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["total"], 2);
    let names: Vec<&str> = body["tunnels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["subdomain"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["app-one", "app-two"]);
}

#[tokio::test]
async fn test_patch_status() {
    let state = test_state();

    let response = router(state.clone())
        .oneshot(request(
            Method::POST,
            "/tunnels",
            Some("user-1"),
            Some(json!({"subdomain": "myapp", "location": "id", "service_type": "http"})),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    let id = body["tunnel"]["id"].as_str().unwrap().to_string();

    let response = router(state.clone())
        .oneshot(request(
            Method::PATCH,
            &format!("/tunnels/{}/status", id),
            Some("user-1"),
            Some(json!({"status": "active", "client_connected": true})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router(state)
        .oneshot(request(Method::GET, "/tunnels", Some("user-1"), None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["tunnels"][0]["status"], "active");
    assert_eq!(body["tunnels"][0]["client_connected"], true);
}
