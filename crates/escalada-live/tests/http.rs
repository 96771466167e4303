mod helpers;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use escalada_live::http::{HttpState, router};
use escalada_live::{Claims, LiveService, Role, StaticTokens};
use helpers::{judge, mem_service, step};
use serde_json::{Value, json};
use tower::ServiceExt;

fn tokens() -> StaticTokens {
    StaticTokens::new()
        .with_token("t-admin", Claims::new("root", Role::Admin))
        .with_token("t-judge", Claims::new("ana", Role::Judge).with_boxes([1]))
        .with_token("t-viewer", Claims::new("vic", Role::Viewer))
        .with_token("t-fan", Claims::new("fan", Role::Spectator))
}

fn app(service: &Arc<LiveService>) -> Router {
    router(HttpState::new(Arc::clone(service), Arc::new(tokens())))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
        .header("user-agent", "judge-tablet")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn command(box_id: u32, version: u64, action_id: &str) -> Value {
    json!({
        "boxId": box_id,
        "boxVersion": version,
        "sessionId": "s1",
        "type": "STEP",
        "payload": {},
        "actionId": action_id,
    })
}

#[tokio::test]
async fn health_is_open() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    let (status, body) = call(&app(&service), get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn commands_need_a_token_with_box_access() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    let app = app(&service);

    let unauthenticated = Request::builder()
        .method("POST")
        .uri("/api/cmd")
        .header("content-type", "application/json")
        .body(Body::from(command(1, 0, "a1").to_string()))
        .unwrap();
    let (status, body) = call(&app, unauthenticated).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("unauthorized"));

    let (status, _) = call(&app, post("/api/cmd", "t-judge", command(2, 0, "a1"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, post("/api/cmd", "t-viewer", command(1, 0, "a1"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, post("/api/cmd", "t-judge", command(1, 0, "a1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "accepted", "newVersion": 1 }));

    let (status, body) = call(&app, post("/api/cmd", "t-judge", command(1, 0, "a1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ignored", "reason": "stale_version" }));
}

#[tokio::test]
async fn invalid_command_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    let mut bad = command(1, 0, "a1");
    bad["type"] = json!("not-upper");
    let (status, body) = call(&app(&service), post("/api/cmd", "t-admin", bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("invalid_command"));
}

#[tokio::test]
async fn state_read_follows_view_scope() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    service.submit(step(1, 0, "a1"), judge()).await.unwrap();
    let app = app(&service);

    let (status, body) = call(&app, get("/api/state/1", Some("t-viewer"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["boxVersion"], json!(1));
    assert_eq!(body["sessionId"], json!("s1"));

    let (status, _) = call(&app, get("/api/state/1", Some("t-fan"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, get("/api/state/1?token=t-viewer", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["boxId"], json!(1));
}

#[tokio::test]
async fn public_listing_only_shows_started_boxes() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    service.submit(step(1, 0, "a1"), judge()).await.unwrap();
    let start = escalada_live::Command::new(2, 0, "START", json!({})).with_session("s9");
    service.submit(start, judge()).await.unwrap();

    let (status, body) = call(&app(&service), get("/api/public/boxes", None)).await;
    assert_eq!(status, StatusCode::OK);
    let boxes = body["boxes"].as_array().unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0]["boxId"], json!(2));
    assert_eq!(boxes[0]["sessionId"], json!(""));
}

#[tokio::test]
async fn admin_routes_require_admin() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    service.submit(step(1, 0, "a1"), judge()).await.unwrap();
    let app = app(&service);

    let (status, _) = call(&app, get("/api/admin/backup/full", Some("t-judge"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, get("/api/admin/backup/full", Some("t-admin"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["snapshot"]["formatVersion"], json!(1));
    assert_eq!(body["snapshot"]["boxes"][0]["boxVersion"], json!(1));

    let (status, _) = call(&app, get("/api/admin/backup/box/4", Some("t-admin"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, get("/api/admin/backup/last", Some("t-admin"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn backup_then_restore_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    service.submit(step(1, 0, "a1"), judge()).await.unwrap();
    let app = app(&service);

    let (status, body) = call(&app, post("/api/admin/ops/backup/now", "t-admin", Value::Null)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, last) = call(&app, get("/api/admin/backup/last", Some("t-admin"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last["file"]["fileName"], body["file"]["fileName"]);

    service.submit(step(1, 1, "a2"), judge()).await.unwrap();

    let (_, full) = call(&app, get("/api/admin/backup/full", Some("t-admin"))).await;
    let mut doc = full["snapshot"].clone();
    doc["boxes"][0]["boxVersion"] = json!(1);
    let (status, body) = call(&app, post("/api/admin/restore", "t-admin", doc)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["status"], json!("conflict"));

    let (status, body) = call(
        &app,
        post("/api/admin/restore", "t-admin", json!({ "formatVersion": 7, "boxes": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("invalid_snapshot"));
}

#[tokio::test]
async fn drill_and_status_report() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    service.submit(step(1, 0, "a1"), judge()).await.unwrap();
    let app = app(&service);

    let (status, report) = call(
        &app,
        post("/api/admin/ops/drill", "t-admin", json!({ "writeBackupFile": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["source"], json!("live"));
    assert_eq!(report["unchanged"], json!(1));
    assert_eq!(report["roundTripOk"], json!(true));
    assert!(report["backupFile"]["fileName"].is_string());

    let (status, ops) = call(&app, get("/api/admin/ops/status", Some("t-admin"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ops["boxes"], json!(1));
    assert_eq!(ops["storage"], json!("files"));
    assert_eq!(ops["backup"]["lastFile"], report["backupFile"]["fileName"]);
}

#[tokio::test]
async fn audit_listing_carries_provenance() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    let app = app(&service);
    call(&app, post("/api/cmd", "t-judge", command(1, 0, "a1"))).await;
    call(&app, post("/api/cmd", "t-judge", command(1, 0, "a2"))).await;

    let (status, body) = call(
        &app,
        get("/api/admin/audit/events?boxId=1&limit=10&includePayload=true", Some("t-admin")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["resultStatus"], json!("ignored"));
    assert_eq!(events[1]["resultStatus"], json!("accepted"));
    assert_eq!(events[1]["actorUsername"], json!("ana"));
    assert_eq!(events[1]["actorRole"], json!("judge"));
    assert_eq!(events[1]["actorIp"], json!("10.0.0.7"));
    assert_eq!(events[1]["actorUserAgent"], json!("judge-tablet"));
    assert_eq!(events[1]["payload"], json!({}));

    let (_, body) = call(&app, get("/api/admin/audit/events?boxId=1", Some("t-admin"))).await;
    assert_eq!(body["events"][0]["payload"], Value::Null);
}

#[tokio::test]
async fn throttled_commands_return_429() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = helpers::test_config(dir.path());
    config.rate_limit.enabled = true;
    config.rate_limit.max_per_second = 1;
    let service =
        helpers::service_with(config, Arc::new(escalada_store::MemStore::new())).await;
    let app = app(&service);

    let (status, _) = call(&app, post("/api/cmd", "t-judge", command(1, 0, "a1"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, post("/api/cmd", "t-judge", command(1, 1, "a2"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], json!("throttled"));

    let (status, stats) = call(
        &app,
        get("/api/admin/ops/rate-limit?key=box:1", Some("t-admin")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["blocked"], json!(true));
}

async fn handshake(addr: std::net::SocketAddr, path: &str) -> (tokio::net::TcpStream, String) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    conn.write_all(request.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0, "server closed before responding");
        head.extend_from_slice(&buf[..n]);
    }
    let status_line = String::from_utf8_lossy(&head)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    (conn, status_line)
}

async fn wait_for_connections(service: &LiveService, expected: usize) {
    for _ in 0..200 {
        if service.broadcaster().total_connections() == expected {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} connections, have {}",
        service.broadcaster().total_connections()
    );
}

#[tokio::test]
async fn socket_upgrade_is_authorized_before_registration() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _store) = mem_service(dir.path()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(&service);
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let (_conn, status) = handshake(addr, "/api/ws/1").await;
    assert!(status.starts_with("HTTP/1.1 401"), "{status}");
    let (_conn, status) = handshake(addr, "/api/ws/1?token=t-fan").await;
    assert!(status.starts_with("HTTP/1.1 403"), "{status}");
    let (_conn, status) = handshake(addr, "/api/public/ws/1").await;
    assert!(status.starts_with("HTTP/1.1 404"), "{status}");
    assert_eq!(service.broadcaster().total_connections(), 0);

    let (conn, status) = handshake(addr, "/api/ws/1?token=t-judge").await;
    assert!(status.starts_with("HTTP/1.1 101"), "{status}");
    wait_for_connections(&service, 1).await;

    drop(conn);
    wait_for_connections(&service, 0).await;
    server.abort();
}
