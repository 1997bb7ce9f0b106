mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request as HttpRequest, StatusCode};
use axum::Router;
use common::*;
use serde_json::{json, Value};
use tonic::Status;
use tower::ServiceExt;

const FETCH: &str = "/stitch.gateway.v1.GatewayService/Fetch";
const DO: &str = "/stitch.gateway.v1.GatewayService/Do";
const LISTEN: &str = "/stitch.gateway.v1.GatewayService/Listen";

fn post(uri: &str, body: Value) -> HttpRequest<Body> {
    HttpRequest::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

async fn send(app: Router, request: HttpRequest<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.expect("receive response");
    let status = response.status();
    let body = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    (status, String::from_utf8(body.to_vec()).expect("utf8 body"))
}

async fn send_json(app: Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_str(&body).expect("json body"))
}

#[tokio::test]
async fn fetch_over_http() {
    let (gateway, _) = demo_gateway();
    let (status, body) = send_json(
        gateway.into_router(),
        post(
            FETCH,
            json!({"requests": [{
                "method": GET_USER,
                "body": {"id": "u1"},
                "mask": [{"name": "name"}, {"name": "display_name"}]
            }]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"responses": [{
            "method": GET_USER,
            "body": {"name": "Ada", "display_name": "ada"},
            "schema": {
                "name": "demo.User",
                "fields": [
                    {"name": "name", "type": {"scalar": "SCALAR_TYPE_STRING"}},
                    {"name": "display_name", "jsonName": "displayName",
                     "type": {"scalar": "SCALAR_TYPE_STRING"}}
                ]
            }
        }]})
    );
}

#[tokio::test]
async fn do_over_http_embeds_errors() {
    let (gateway, transport) = demo_gateway();
    transport.on_unary(UPDATE_USER, |_, _| Err(Status::aborted("conflict")));

    let (status, body) = send_json(
        gateway.into_router(),
        post(DO, json!({"requests": [{"method": UPDATE_USER, "body": {"id": "u1"}}]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["responses"][0]["body"]["code"], "ABORTED");
}

#[tokio::test]
async fn errors_map_to_http_status() {
    let (gateway, _) = demo_gateway();
    let app = gateway.into_router();

    let (status, body) = send_json(
        app.clone(),
        post(FETCH, json!({"requests": [{"method": "demo.UserService.Nope"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = send_json(app.clone(), post(FETCH, json!({"requests": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let request = HttpRequest::post(FETCH)
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send_json(app.clone(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, body) = send_json(
        app,
        post(FETCH, json!({"requests": [{"method": GET_USER, "body": {"id": "u9"}}]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "user u9 not found");
}

#[tokio::test]
async fn inbound_headers_are_filtered_and_forwarded() {
    let (gateway, transport) = demo_gateway();
    let request = HttpRequest::post(FETCH)
        .header(header::CONTENT_TYPE, "application/json")
        .header("authorization", "Bearer abc")
        .header("x-request-id", "req-1")
        .header("connection", "keep-alive")
        .header("stitch-operations", "spoofed")
        .header("connect-timeout-ms", "5000")
        .body(Body::from(
            json!({"requests": [{"method": GET_USER, "body": {"id": "u1"}}]}).to_string(),
        ))
        .unwrap();

    let (status, _) = send(gateway.into_router(), request).await;
    assert_eq!(status, StatusCode::OK);

    let call = &transport.calls_to(GET_USER)[0];
    assert_eq!(call.header("authorization").as_deref(), Some("Bearer abc"));
    assert_eq!(call.header("x-request-id").as_deref(), Some("req-1"));
    assert!(call.header("connection").is_none());
    assert!(call.header("content-type").is_none());
    assert!(call.header("connect-timeout-ms").is_none());
    assert!(call.header("grpc-timeout").is_some());
    assert_eq!(
        call.operations(),
        vec![
            "stitch.gateway.v1.GatewayService.Fetch".to_string(),
            GET_USER.to_string()
        ]
    );
}

#[tokio::test]
async fn listen_streams_server_sent_events() {
    let (gateway, _) = demo_gateway();
    let (status, body) = send(
        gateway.into_router(),
        post(
            LISTEN,
            json!({"request": {"method": WATCH_USERS, "mask": [{"name": "id"}]}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let events: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_eq!(events.len(), 5);
    assert_eq!(events[0]["response"]["body"], json!({"id": "w1"}));
    assert!(events[0]["response"].get("schema").is_some());
    assert!(events[1]["response"].get("schema").is_none());
    assert_eq!(events[4]["response"]["body"], json!({"id": "w5"}));
}

#[tokio::test]
async fn listen_failure_ends_with_error_event() {
    let (gateway, transport) = demo_gateway();
    transport.on_stream(WATCH_USERS, |pool, _| {
        Ok(vec![
            Ok(msg(pool, "demo.User", json!({"id": "w1"}))),
            Err(Status::data_loss("truncated")),
        ])
    });

    let (status, body) = send(
        gateway.into_router(),
        post(LISTEN, json!({"request": {"method": WATCH_USERS}})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: error"));
    assert!(body.contains(r#"{"code":"data_loss","message":"truncated"}"#));
}

#[tokio::test]
async fn listen_rejects_unary_methods() {
    let (gateway, _) = demo_gateway();
    let (status, body) = send_json(
        gateway.into_router(),
        post(LISTEN, json!({"request": {"method": GET_USER}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn health_reports_registry_size() {
    let (gateway, _) = demo_gateway();
    let request = HttpRequest::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send_json(gateway.into_router(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy", "methods": 4, "relations": 3}));
}

#[tokio::test]
async fn metrics_route_follows_the_builder_flag() {
    let (gateway, _) = demo_gateway();
    let request = HttpRequest::get("/metrics").body(Body::empty()).unwrap();
    let (status, _) = send(gateway.into_router(), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let pool = pool();
    let transport = MockTransport::new(pool.clone());
    install_demo_handlers(&transport);
    let gateway = demo_builder(&pool, transport).enable_metrics().build().unwrap();
    let app = gateway.into_router();

    let (status, _) = send(
        app.clone(),
        post(FETCH, json!({"requests": [{"method": GET_USER, "body": {"id": "u1"}}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = HttpRequest::get("/metrics").body(Body::empty()).unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("stitch_requests_total"));
}
