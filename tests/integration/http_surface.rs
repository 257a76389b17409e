//! HTTP surfaces: backlog and admin routes of the chat gateway, and the
//! health server wired to a real service handle

use crate::fixtures::{local_relay, matched_pair, send, test_config};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chattr_relay::auth::StaticTokenAuthenticator;
use chattr_relay::bus::LocalBus;
use chattr_relay::relay::{router, GatewayState, Relay};
use chattr_relay::service::AppState;
use chattr_relay::storage::InMemoryChatStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for oneshot

const ADMIN_TOKEN: &str = "admin-secret";

fn gateway(relay: Arc<Relay>) -> Router {
    let tokens = HashMap::from([
        ("alice-token".to_string(), "alice".to_string()),
        ("bob-token".to_string(), "bob".to_string()),
        ("mallory-token".to_string(), "mallory".to_string()),
    ]);
    router(GatewayState {
        relay,
        authenticator: Arc::new(StaticTokenAuthenticator::new(tokens)),
        heartbeat_interval: Duration::from_secs(30),
        admin_token: Some(ADMIN_TOKEN.to_string()),
    })
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::POST).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_backlog_route_returns_events_after_cursor() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, alice, bob) = matched_pair(&relay, "alice", "bob").await;
    send(&relay, &alice, room.room_id, "one", "a-1").await;
    send(&relay, &bob, room.room_id, "two", "b-1").await;
    send(&relay, &alice, room.room_id, "three", "a-2").await;
    let app = gateway(relay);

    let response = app
        .clone()
        .oneshot(get(
            &format!("/rooms/{}/events?since=1", room.room_id),
            Some("bob-token"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["roomId"], room.room_id.to_string());
    let events = body["events"].as_array().unwrap();
    let ids: Vec<u64> = events
        .iter()
        .map(|event| event["eventId"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(events[0]["payload"], "two");

    // No cursor means the whole log.
    let response = app
        .oneshot(get(
            &format!("/rooms/{}/events", room.room_id),
            Some("alice-token"),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["events"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_backlog_route_rejects_outsiders() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, _alice, _bob) = matched_pair(&relay, "alice", "bob").await;
    let app = gateway(relay);
    let uri = format!("/rooms/{}/events", room.room_id);

    let response = app.clone().oneshot(get(&uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(get(&uri, Some("forged-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "UNAUTHORIZED");

    let response = app
        .clone()
        .oneshot(get(&uri, Some("mallory-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["type"], "ERROR");

    let response = app
        .oneshot(get(
            &format!("/rooms/{}/events", uuid::Uuid::new_v4()),
            Some("alice-token"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_close_route() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, _alice, _bob) = matched_pair(&relay, "alice", "bob").await;
    let app = gateway(relay.clone());
    let uri = format!("/admin/rooms/{}/close", room.room_id);

    let response = app.clone().oneshot(post(&uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = app
        .clone()
        .oneshot(post(&uri, Some("alice-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(relay.rooms().get(room.room_id).unwrap().unwrap().is_active());

    let response = app
        .clone()
        .oneshot(post(&uri, Some(ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["closed"], true);
    assert_eq!(body["alreadyClosed"], false);

    let response = app.oneshot(post(&uri, Some(ADMIN_TOKEN))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["alreadyClosed"], true);
    assert!(!relay.rooms().get(room.room_id).unwrap().unwrap().is_active());
}

#[tokio::test]
async fn test_health_server_reports_live_service() {
    let app_state = AppState::with_components(
        test_config(),
        uuid::Uuid::new_v4(),
        Arc::new(LocalBus),
        Arc::new(InMemoryChatStore::new()),
    )
    .unwrap();
    let app = app_state.metrics_service().health_server().create_router();

    let response = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    app_state.handle().set_running(true);
    let (_room, _alice, _bob) = matched_pair(&app_state.relay(), "alice", "bob").await;

    let response = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");

    let response = app.clone().oneshot(get("/ready", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(get("/stats", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await;
    assert_eq!(stats["rooms"]["active"], 1);
    assert_eq!(stats["rooms"]["opened"], 1);
    assert_eq!(stats["connections"]["local"], 2);
    assert_eq!(
        stats["service"]["instanceId"],
        app_state.instance_id().to_string()
    );

    let response = app.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("chattr_rooms_opened_total"));
    assert!(text.contains("chattr_matches_total"));
}
