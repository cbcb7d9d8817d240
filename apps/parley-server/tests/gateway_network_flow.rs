use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode};
use futures_util::{SinkExt, StreamExt};
use parley_server::{build_router, AppConfig};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tower::ServiceExt;

#[derive(Debug, serde::Deserialize)]
struct AuthResponse {
    access_token: String,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn parse_json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

async fn register_and_login(app: &axum::Router, username: &str, ip: &str) -> AuthResponse {
    let register = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username":username,"password":"super-secure-password"}).to_string(),
        ))
        .expect("register request should build");
    let register_response = app
        .clone()
        .oneshot(register)
        .await
        .expect("register request should execute");
    assert_eq!(register_response.status(), StatusCode::OK);

    let login = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username":username,"password":"super-secure-password"}).to_string(),
        ))
        .expect("login request should build");
    let login_response = app
        .clone()
        .oneshot(login)
        .await
        .expect("login request should execute");
    assert_eq!(login_response.status(), StatusCode::OK);

    parse_json_body(login_response).await
}

async fn user_id_of(app: &axum::Router, auth: &AuthResponse, ip: &str) -> String {
    let me = Request::builder()
        .method("GET")
        .uri("/auth/me")
        .header("authorization", format!("Bearer {}", auth.access_token))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .expect("me request should build");
    let response = app
        .clone()
        .oneshot(me)
        .await
        .expect("me request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = parse_json_body(response).await;
    payload["user_id"]
        .as_str()
        .expect("user id should exist")
        .to_owned()
}

async fn create_direct_conversation(
    app: &axum::Router,
    auth: &AuthResponse,
    ip: &str,
    peer_user_id: &str,
) -> String {
    let create = Request::builder()
        .method("POST")
        .uri("/conversations/direct")
        .header("authorization", format!("Bearer {}", auth.access_token))
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(json!({"peer_user_id":peer_user_id}).to_string()))
        .expect("create direct request should build");
    let response = app
        .clone()
        .oneshot(create)
        .await
        .expect("create direct request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = parse_json_body(response).await;
    payload["conversation_id"]
        .as_str()
        .expect("conversation id should exist")
        .to_owned()
}

fn test_app() -> axum::Router {
    build_router(&AppConfig {
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 200,
        auth_route_requests_per_minute: 200,
        ..AppConfig::default()
    })
    .expect("router should build")
}

async fn connect_gateway(addr: std::net::SocketAddr, auth: &AuthResponse, ip: &str) -> WsStream {
    let ws_url = format!("ws://{addr}/gateway?access_token={}", auth.access_token);
    let mut ws_request = ws_url
        .into_client_request()
        .expect("websocket request should build");
    ws_request.headers_mut().insert(
        "x-forwarded-for",
        http::HeaderValue::from_str(ip).expect("ip header should build"),
    );
    let (socket, _response) = connect_async(ws_request)
        .await
        .expect("websocket handshake should succeed");
    socket
}

async fn next_text_event(socket: &mut WsStream) -> Value {
    loop {
        let event = socket
            .next()
            .await
            .expect("event should be emitted")
            .expect("event should decode");
        if let Message::Text(text) = event {
            return serde_json::from_str(&text).expect("event should be valid json");
        }
    }
}

async fn next_event_of_type(socket: &mut WsStream, event_type: &str) -> Value {
    for _ in 0..8 {
        let event = next_text_event(socket).await;
        if event["t"] == event_type {
            return event;
        }
    }
    panic!("expected event type {event_type}");
}

#[tokio::test]
async fn message_read_and_typing_flow_works_over_network() {
    let app = test_app();

    let alice = register_and_login(&app, "network_alice", "203.0.113.44").await;
    let bob = register_and_login(&app, "network_bob", "203.0.113.45").await;
    let bob_id = user_id_of(&app, &bob, "203.0.113.45").await;
    let conversation_id =
        create_direct_conversation(&app, &alice, "203.0.113.44", &bob_id).await;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("server should run without errors");
    });

    let mut alice_socket = connect_gateway(addr, &alice, "203.0.113.44").await;
    let ready = next_text_event(&mut alice_socket).await;
    assert_eq!(ready["t"], "ready");
    assert_eq!(ready["d"]["conversation_ids"][0], conversation_id.as_str());

    let mut bob_socket = connect_gateway(addr, &bob, "203.0.113.45").await;
    let bob_ready = next_text_event(&mut bob_socket).await;
    assert_eq!(bob_ready["t"], "ready");

    // Bob's first connection announces him to the shared conversation.
    let online = next_event_of_type(&mut alice_socket, "user_online").await;
    assert_eq!(online["d"]["user_id"], bob_id.as_str());

    let send = json!({
        "v": 1,
        "t": "send_message",
        "d": {
            "conversation_id": conversation_id,
            "content": "hello over network"
        }
    });
    alice_socket
        .send(Message::Text(send.to_string().into()))
        .await
        .expect("send_message event should send");

    let received = next_event_of_type(&mut bob_socket, "receive_message").await;
    assert_eq!(received["d"]["content"], "hello over network");
    let message_id = received["d"]["message_id"]
        .as_str()
        .expect("message id should exist")
        .to_owned();

    let mark_read = json!({
        "v": 1,
        "t": "mark_read",
        "d": {
            "conversation_id": conversation_id,
            "message_id": message_id
        }
    });
    bob_socket
        .send(Message::Text(mark_read.to_string().into()))
        .await
        .expect("mark_read event should send");

    let read = next_event_of_type(&mut alice_socket, "message_read").await;
    assert_eq!(read["d"]["message_id"], message_id.as_str());
    assert_eq!(read["d"]["reader_id"], bob_id.as_str());

    let typing = json!({
        "v": 1,
        "t": "start_typing",
        "d": { "conversation_id": conversation_id }
    });
    bob_socket
        .send(Message::Text(typing.to_string().into()))
        .await
        .expect("start_typing event should send");

    let typing_event = next_event_of_type(&mut alice_socket, "user_typing").await;
    assert_eq!(typing_event["d"]["user_id"], bob_id.as_str());

    // Closing Bob's only connection flips him offline for everyone else.
    bob_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    let offline = next_event_of_type(&mut alice_socket, "user_offline").await;
    assert_eq!(offline["d"]["user_id"], bob_id.as_str());

    alice_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    server.abort();
}

#[tokio::test]
async fn presence_edges_reach_users_without_shared_conversations() {
    let app = test_app();

    // Carol and Dave are both logged in but share no conversation.
    let carol = register_and_login(&app, "network_carol", "203.0.113.60").await;
    let dave = register_and_login(&app, "network_dave", "203.0.113.61").await;
    let dave_id = user_id_of(&app, &dave, "203.0.113.61").await;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("server should run without errors");
    });

    let mut carol_socket = connect_gateway(addr, &carol, "203.0.113.60").await;
    let ready = next_text_event(&mut carol_socket).await;
    assert_eq!(ready["t"], "ready");

    let mut dave_socket = connect_gateway(addr, &dave, "203.0.113.61").await;
    let dave_ready = next_text_event(&mut dave_socket).await;
    assert_eq!(dave_ready["t"], "ready");

    let online = next_event_of_type(&mut carol_socket, "user_online").await;
    assert_eq!(online["d"]["user_id"], dave_id.as_str());

    dave_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    let offline = next_event_of_type(&mut carol_socket, "user_offline").await;
    assert_eq!(offline["d"]["user_id"], dave_id.as_str());

    carol_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    server.abort();
}

#[tokio::test]
async fn websocket_disconnect_does_not_block_rest_requests() {
    let app = test_app();

    let alice = register_and_login(&app, "network_alice", "203.0.113.55").await;
    let bob = register_and_login(&app, "network_bob", "203.0.113.56").await;
    let bob_id = user_id_of(&app, &bob, "203.0.113.56").await;
    let conversation_id =
        create_direct_conversation(&app, &alice, "203.0.113.55", &bob_id).await;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server_app = app.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, server_app)
            .await
            .expect("server should run without errors");
    });

    let mut socket = connect_gateway(addr, &alice, "203.0.113.55").await;
    let ready = next_text_event(&mut socket).await;
    assert_eq!(ready["t"], "ready");

    socket
        .close(None)
        .await
        .expect("socket close should succeed");
    let _ = tokio::time::timeout(Duration::from_millis(250), socket.next()).await;

    let list = Request::builder()
        .method("GET")
        .uri("/conversations")
        .header("authorization", format!("Bearer {}", alice.access_token))
        .header("x-forwarded-for", "203.0.113.55")
        .body(Body::empty())
        .expect("list request should build");
    let response = app
        .clone()
        .oneshot(list)
        .await
        .expect("list request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = parse_json_body(response).await;
    assert_eq!(payload[0]["conversation_id"], conversation_id.as_str());

    server.abort();
}
