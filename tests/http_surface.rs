//! Router-level tests: identity extraction, response shapes, and the
//! subscription endpoints.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use messaging_core::app;
use messaging_core::config::{AppState, CoreConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_app() -> axum::Router {
    let state = AppState::build(CoreConfig::in_memory())
        .await
        .expect("state wiring");
    app(state)
}

fn post_json(uri: &str, identity: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(identity) = identity {
        builder = builder.header("x-identity", identity);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/conversations").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn conversation_and_message_round_trip() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/conversations",
            Some("alice"),
            json!({ "type": "direct", "participants": ["bob"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let conversation = json_body(response).await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();
    assert_eq!(conversation["participants"][0]["identity"], "alice");
    assert_eq!(conversation["participants"][0]["role"], "admin");
    assert_eq!(conversation["participants"][1]["identity"], "bob");

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/conversations/{}/messages", conversation_id),
            Some("alice"),
            json!({ "content": "hello" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let message = json_body(response).await;
    assert_eq!(message["status"], "sent");
    assert_eq!(message["sender_id"], "alice");

    // Bob sees it; Mallory gets a 403, not an empty list.
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/conversations/{}/messages", conversation_id))
                .header("x-identity", "bob")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = json_body(response).await;
    assert_eq!(page.as_array().unwrap().len(), 1);

    let response = app
        .oneshot(
            Request::get(format!("/conversations/{}/messages", conversation_id))
                .header("x-identity", "mallory")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn empty_message_is_a_validation_error() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/conversations",
            Some("alice"),
            json!({ "type": "direct", "participants": ["bob"] }),
        ))
        .await
        .unwrap();
    let conversation = json_body(response).await;
    let conversation_id = conversation["id"].as_str().unwrap();

    let response = app
        .oneshot(post_json(
            &format!("/conversations/{}/messages", conversation_id),
            Some("alice"),
            json!({ "content": "" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn client_token_subscribes_anonymously_to_public_channels() {
    let app = test_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/subscribe")
        .header("content-type", "application/json")
        .header("x-client-token", "kiosk-7")
        .body(Body::from(json!({ "channel": "announcements" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["subscribed"], true);
    assert_eq!(body["channel"], "announcements");

    // Same token, same synthetic identity: unsubscribe undoes it.
    let request = Request::builder()
        .method("POST")
        .uri("/unsubscribe")
        .header("content-type", "application/json")
        .header("x-client-token", "kiosk-7")
        .body(Body::from(json!({ "channel": "announcements" }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["subscribed"], false);
}

#[tokio::test]
async fn conversation_channels_are_participant_only() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/conversations",
            Some("alice"),
            json!({ "type": "direct", "participants": ["bob"] }),
        ))
        .await
        .unwrap();
    let conversation = json_body(response).await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();
    let channel = format!("conversation:{}", conversation_id);

    // A non-participant cannot bind to the conversation's channel.
    let response = app
        .clone()
        .oneshot(post_json(
            "/subscribe",
            Some("mallory"),
            json!({ "channel": channel }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // And nothing leaks through the queue: alice's message never reaches
    // mallory's drain.
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/conversations/{}/messages", conversation_id),
            Some("alice"),
            json!({ "content": "secret" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::get("/poll")
                .header("x-identity", "mallory")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["events"].as_array().unwrap().len(), 0);

    // Participants still subscribe fine.
    let response = app
        .oneshot(post_json(
            "/subscribe",
            Some("bob"),
            json!({ "channel": format!("conversation:{}", conversation_id) }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn anonymous_identity_cannot_subscribe_to_conversation_channels() {
    let app = test_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/subscribe")
        .header("content-type", "application/json")
        .header("x-client-token", "kiosk-7")
        .body(Body::from(
            json!({ "channel": "conversation:c1" }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn anonymous_identity_cannot_create_conversations() {
    let app = test_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/conversations")
        .header("content-type", "application/json")
        .header("x-client-token", "kiosk-7")
        .body(Body::from(
            json!({ "type": "direct", "participants": ["bob"] }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
