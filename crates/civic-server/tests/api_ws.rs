use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use civic_db::{run_migrations, DbRuntimeSettings};
use civic_hub::PubSubHub;
use civic_identity::{Identity, MemoryIdentityStore};
use civic_server::{
    app, Actor, AppState, NewTicketRequest, RandomAssignment, TicketService, WsTokenSigner,
};
use civic_types::Role;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tower::ServiceExt;

const SECRET: &[u8] = b"integration-secret";

fn signer() -> WsTokenSigner {
    WsTokenSigner::new(SECRET, 60)
}

fn ws_url(addr: std::net::SocketAddr, user_id: &str) -> String {
    format!("ws://{addr}/ws?token={}", signer().issue(user_id))
}

fn state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("civic.db");
    let pool = civic_db::create_pool(
        path.to_str().expect("temp path is utf-8"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");
    {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
    }

    let identities = MemoryIdentityStore::with_identities([
        Identity::new("resident-a", Role::Resident, true),
        Identity::new("resident-b", Role::Resident, true),
        Identity::new("staff-1", Role::Staff, true),
        Identity::new("pending-staff", Role::Staff, false),
    ]);
    let service = TicketService::new(
        pool,
        Arc::new(identities),
        Arc::new(RandomAssignment::new(Default::default())),
        PubSubHub::new(),
    );
    (
        AppState {
            service,
            tokens: signer(),
            connection_buffer: 64,
        },
        dir,
    )
}

async fn spawn_server(state: AppState) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app(state))
            .await
            .expect("server error");
    });
    addr
}

/// Reads text frames until one matches `pred`.
async fn next_matching<S>(ws: &mut S, pred: impl Fn(&Value) -> bool) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            let json: Value = serde_json::from_str(text.as_str()).expect("frame is json");
            if pred(&json) {
                return json;
            }
        }
    }
}

#[tokio::test]
async fn health_check_returns_ok() {
    let (state, _dir) = state();
    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn unknown_and_unverified_users_are_rejected() {
    let (state, _dir) = state();
    let addr = spawn_server(state).await;

    for user_id in ["nobody", "pending-staff"] {
        let result = connect_async(ws_url(addr, user_id)).await;
        assert!(result.is_err(), "connect as {user_id} should fail");
    }
}

#[tokio::test]
async fn bare_and_forged_credentials_are_rejected() {
    let (state, _dir) = state();
    let addr = spawn_server(state).await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs();
    let queries = [
        String::new(),
        "?userId=staff-1".to_string(),
        "?token=staff-1".to_string(),
        format!(
            "?token={}",
            WsTokenSigner::new(b"someone-else", 60).issue("staff-1")
        ),
        format!("?token={}", signer().issue_at("staff-1", now - 3_600)),
    ];
    for query in &queries {
        let result = connect_async(format!("ws://{addr}/ws{query}")).await;
        assert!(result.is_err(), "connect with {query:?} should fail");
    }

    // The same user with a fresh token gets in.
    connect_async(ws_url(addr, "staff-1"))
        .await
        .expect("signed token connects");
}

#[tokio::test]
async fn test_ws_lifecycle() {
    let (state, _dir) = state();
    let service = state.service.clone();
    let hub = service.hub().clone();
    let addr = spawn_server(state).await;

    let (mut resident_ws, _) = connect_async(ws_url(addr, "resident-a"))
        .await
        .expect("failed to connect");
    let (mut staff_ws, _) = connect_async(ws_url(addr, "staff-1"))
        .await
        .expect("failed to connect");

    // Registration happens after the upgrade completes.
    for _ in 0..50 {
        if hub.connection_count().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.connection_count().await, 2);

    let resident = Actor::new("resident-a", Role::Resident);
    let ticket = service
        .create_ticket(
            &resident,
            NewTicketRequest {
                title: "Overflowing bin".to_string(),
                description: "Bin outside the bakery has not been emptied.".to_string(),
                category: "sanitation".to_string(),
                priority: None,
            },
        )
        .await
        .expect("create");

    let announced = next_matching(&mut staff_ws, |f| f["event"] == "ticket:new").await;
    assert_eq!(announced["topic"], "role:staff-or-admin");
    assert_eq!(announced["payload"]["ticket"]["id"], ticket.id.as_str());

    let pushed = next_matching(&mut resident_ws, |f| f["event"] == "notification:new").await;
    assert_eq!(pushed["topic"], "user:resident-a");

    resident_ws
        .send(Message::Text(
            json!({ "type": "subscribe", "ticketId": ticket.id })
                .to_string()
                .into(),
        ))
        .await
        .expect("failed to send subscribe");
    let ack = next_matching(&mut resident_ws, |f| f["type"] == "subscribed").await;
    assert_eq!(ack["ticketId"], ticket.id.as_str());

    service
        .add_comment(
            &Actor::new("staff-1", Role::Staff),
            &ticket.id,
            "Pickup scheduled for tomorrow.",
            false,
        )
        .await
        .expect("comment");

    let topic = format!("ticket:{}", ticket.id);
    let comment = next_matching(&mut resident_ws, |f| {
        f["event"] == "comment:added" && f["topic"] == topic.as_str()
    })
    .await;
    assert_eq!(
        comment["payload"]["comment"]["message"],
        "Pickup scheduled for tomorrow."
    );

    // Malformed frames get an error reply and keep the socket open.
    resident_ws
        .send(Message::Text("not json".into()))
        .await
        .expect("send");
    let error = next_matching(&mut resident_ws, |f| f["type"] == "error").await;
    assert_eq!(error["message"], "invalid message format");

    resident_ws.close(None).await.expect("close");
    for _ in 0..50 {
        if hub.connection_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn subscribe_to_foreign_ticket_is_refused() {
    let (state, _dir) = state();
    let service = state.service.clone();
    let addr = spawn_server(state).await;

    let ticket = service
        .create_ticket(
            &Actor::new("resident-a", Role::Resident),
            NewTicketRequest {
                title: "Noise complaint".to_string(),
                description: "Construction before 7am.".to_string(),
                category: "noise".to_string(),
                priority: None,
            },
        )
        .await
        .expect("create");

    let (mut ws, _) = connect_async(ws_url(addr, "resident-b"))
        .await
        .expect("failed to connect");
    ws.send(Message::Text(
        json!({ "type": "subscribe", "ticketId": ticket.id })
            .to_string()
            .into(),
    ))
    .await
    .expect("send");

    let error = next_matching(&mut ws, |f| f["type"] == "error").await;
    assert!(error["message"]
        .as_str()
        .expect("message is a string")
        .starts_with("forbidden"));
}
