//! Shared helpers: start a real server on a free port and drive raw
//! WebSocket clients against it.

#![allow(dead_code)]

use std::sync::Arc;

use annolive_collab::protocol::envelope;
use annolive_collab::{issue_token, Claims, CollabServer, JwtVerifier, MemoryAnnotationStore, Outbound, Role, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "integration-secret";
pub const WAIT: Duration = Duration::from_secs(3);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub server: CollabServer,
    pub store: Arc<MemoryAnnotationStore>,
    pub url: String,
}

/// Start a server on a free port.
pub async fn start(config: ServerConfig) -> TestServer {
    start_with_store(config, Arc::new(MemoryAnnotationStore::new())).await
}

pub async fn start_with_store(config: ServerConfig, store: Arc<MemoryAnnotationStore>) -> TestServer {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..config
    };
    let server = CollabServer::new(config, Arc::new(JwtVerifier::new(SECRET)), store.clone());
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    TestServer { server, store, url }
}

pub fn token(user: &str, role: Role, docs: &[&str]) -> String {
    let claims = Claims {
        sub: user.to_string(),
        name: Some(user.to_string()),
        role,
        docs: docs.iter().map(|d| d.to_string()).collect(),
        exp: chrono::Utc::now().timestamp() as u64 + 3600,
    };
    issue_token(SECRET, &claims).unwrap()
}

/// Open a socket without authenticating.
pub async fn open(url: &str, project: &str, document: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/ws?projectId={project}&documentId={document}"))
        .await
        .unwrap();
    ws
}

pub async fn send(ws: &mut Ws, kind: &str, payload: Value) {
    ws.send(Message::text(envelope(kind, payload))).await.unwrap();
}

/// Next decoded server frame; `None` once the socket is closed.
pub async fn next(ws: &mut Ws) -> Option<Outbound> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("timed out waiting for a frame") {
            Some(Ok(Message::Text(text))) => return Some(Outbound::decode(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

pub async fn recv(ws: &mut Ws) -> Outbound {
    next(ws).await.expect("socket closed")
}

/// Skip frames until one of kind `kind` arrives.
pub async fn recv_kind(ws: &mut Ws, kind: &str) -> Outbound {
    loop {
        let msg = recv(ws).await;
        if msg.kind() == kind {
            return msg;
        }
    }
}

/// Expect an `error` frame with `code`, skipping anything else.
pub async fn expect_error(ws: &mut Ws, code: &str) {
    match recv_kind(ws, "error").await {
        Outbound::Error(e) => assert_eq!(e.code, code, "unexpected error: {}", e.message),
        _ => unreachable!(),
    }
}

/// Wait until the server closes the socket.
pub async fn expect_closed(ws: &mut Ws) {
    while next(ws).await.is_some() {}
}

/// Authenticate on `project/document` and consume `authenticated` + `snapshot`.
pub async fn join(url: &str, document: &str, user: &str, role: Role) -> (Ws, annolive_collab::protocol::RoomSnapshot) {
    let mut ws = open(url, "p1", document).await;
    send(&mut ws, "authenticate", json!({ "token": token(user, role, &["*"]) })).await;
    match recv(&mut ws).await {
        Outbound::Authenticated(p) => assert_eq!(p.user_id, user),
        other => panic!("expected authenticated, got {other:?}"),
    }
    match recv(&mut ws).await {
        Outbound::Snapshot(snapshot) => (ws, snapshot),
        other => panic!("expected snapshot, got {other:?}"),
    }
}

pub async fn annotate(ws: &mut Ws, label: &str, start: u32, end: u32) {
    send(
        ws,
        "annotation_submitted",
        json!({ "label": label, "start": start, "end": end, "text": "" }),
    )
    .await;
}
