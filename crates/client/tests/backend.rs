use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use docchat_client::{
    ApiClient, ChannelRenderer, ClientConfig, ClientError, ConnectionState, DispatchState,
    Dispatcher, ErrorKind, RestTransport, Role, Session, StreamingTransport, TransportFault,
    TransportMode, TransportSignal, TungsteniteConnector,
};
use docchat_storage::{AUTH_TOKEN_KEY, KeyValueStore, MemoryStore};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

const GOOD_TOKEN: &str = "good-token";
const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Recorded {
    chat_bodies: Vec<Value>,
    authorizations: Vec<Option<String>>,
    stream_frames: Vec<Value>,
}

type Shared = Arc<Mutex<Recorded>>;

#[derive(Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

async fn spawn_backend() -> (SocketAddr, Shared) {
    let recorded = Shared::default();
    let app = Router::new()
        .route("/api/auth/me", get(profile))
        .route("/api/chat/message", post(chat))
        .route("/api/chat/recommendations", get(bad_gateway))
        .route("/ws/chat", get(stream_chat))
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn profile(headers: HeaderMap) -> Response {
    match bearer(&headers).as_deref() {
        Some(GOOD_TOKEN) => {
            Json(json!({"user": {"user_id": "u-1", "username": "ada"}})).into_response()
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "登录已过期，请重新登录"})),
        )
            .into_response(),
    }
}

async fn chat(
    State(recorded): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut recorded = recorded.lock().unwrap();
    recorded.chat_bodies.push(body);
    recorded.authorizations.push(bearer(&headers));
    Json(json!({"response": "Hello! How can I help?", "relevant_chunks": []}))
}

async fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "<html>Bad Gateway</html>").into_response()
}

async fn stream_chat(
    ws: WebSocketUpgrade,
    State(recorded): State<Shared>,
    Query(query): Query<StreamQuery>,
) -> Response {
    match query.token.as_deref() {
        None => StatusCode::FORBIDDEN.into_response(),
        Some(GOOD_TOKEN) => ws.on_upgrade(move |socket| answer_in_chunks(socket, recorded)),
        Some(_) => ws.on_upgrade(close_as_unauthorized),
    }
}

async fn answer_in_chunks(mut socket: WebSocket, recorded: Shared) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        recorded.lock().unwrap().stream_frames.push(frame);

        let replies = [
            json!({"type": "start"}),
            json!({"type": "chunk", "content": "Hi"}),
            json!({"type": "chunk", "content": " there"}),
            json!({"type": "end"}),
        ];
        for reply in replies {
            if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

async fn close_as_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: "invalid token".into(),
        })))
        .await;
}

fn client_for(
    addr: SocketAddr,
    token: Option<&str>,
) -> (ApiClient, Arc<Session>, Arc<MemoryStore>) {
    let store = Arc::new(match token {
        Some(token) => MemoryStore::with_entries([(AUTH_TOKEN_KEY, token)]),
        None => MemoryStore::new(),
    });
    let session = Session::restore(store.clone());
    let rest = RestTransport::new(config_for(addr), session.clone()).unwrap();
    (ApiClient::new(rest), session, store)
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig::resolve_with(Some(&format!("http://{addr}")), None, None).unwrap()
}

async fn next_fault(signals: &mut mpsc::UnboundedReceiver<TransportSignal>) -> TransportFault {
    loop {
        match timeout(WAIT, signals.recv()).await.unwrap() {
            Some(TransportSignal::Fault(fault)) => return fault,
            Some(TransportSignal::Event(_)) => continue,
            None => panic!("signal channel closed before a fault"),
        }
    }
}

#[tokio::test]
async fn chat_request_carries_bearer_and_omits_absent_document() {
    let (addr, recorded) = spawn_backend().await;
    let (api, _, _) = client_for(addr, Some(GOOD_TOKEN));

    let reply = api.send_message("hello", None).await.unwrap();
    assert_eq!(reply.response, "Hello! How can I help?");
    assert!(reply.relevant_chunks.is_empty());

    api.send_message("scoped", Some("doc-1")).await.unwrap();

    let recorded = recorded.lock().unwrap();
    assert_eq!(
        recorded.chat_bodies,
        vec![
            json!({"message": "hello"}),
            json!({"message": "scoped", "document_id": "doc-1"}),
        ]
    );
    assert!(recorded
        .authorizations
        .iter()
        .all(|token| token.as_deref() == Some(GOOD_TOKEN)));
}

#[tokio::test]
async fn rejected_profile_check_clears_the_stored_credential() {
    let (addr, _) = spawn_backend().await;
    let (api, session, store) = client_for(addr, Some("stale-token"));
    assert!(session.is_authenticated());

    let error = api.profile().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Unauthorized);
    assert_eq!(error.to_string(), "登录已过期，请重新登录");
    assert!(!session.is_authenticated());
    assert_eq!(store.get(AUTH_TOKEN_KEY).unwrap(), None);
}

#[tokio::test]
async fn non_json_error_body_falls_back_to_generic_message() {
    let (addr, _) = spawn_backend().await;
    let (api, session, _) = client_for(addr, Some(GOOD_TOKEN));

    match api.recommendations().await.unwrap_err() {
        ClientError::Server {
            status, message, ..
        } => {
            assert_eq!(status, 502);
            assert_eq!(message, docchat_client::rest::REQUEST_FAILED_MESSAGE);
        }
        other => panic!("expected a server error, got {other:?}"),
    }
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn streamed_chunks_land_as_one_reply() {
    let (addr, recorded) = spawn_backend().await;
    let (api, session, store) = client_for(addr, Some(GOOD_TOKEN));
    let (streaming, mut signals) =
        StreamingTransport::new(config_for(addr), Arc::new(TungsteniteConnector));
    let (renderer, _renders) = ChannelRenderer::new();
    let mut dispatcher = Dispatcher::new(
        session,
        Arc::new(api),
        streaming,
        store,
        Box::new(renderer),
    );

    dispatcher.bootstrap().await.unwrap();
    dispatcher.set_transport(TransportMode::Streaming).await;
    while dispatcher.connection_state() != ConnectionState::Connected {
        let signal = timeout(WAIT, signals.recv()).await.unwrap().unwrap();
        dispatcher.handle_signal(signal).await;
    }

    dispatcher.send("hi", None).await.unwrap();
    loop {
        let signal = timeout(WAIT, signals.recv()).await.unwrap().unwrap();
        dispatcher.handle_signal(signal).await;
        if dispatcher.transcript().len() == 2 && dispatcher.state() == DispatchState::Idle {
            break;
        }
    }

    let entries = dispatcher.transcript().entries();
    assert_eq!(entries[0].role, Role::User);
    assert_eq!(entries[1].role, Role::Assistant);
    assert_eq!(entries[1].content, "Hi there");
    assert!(!entries[1].streaming);

    let frames = recorded.lock().unwrap().stream_frames.clone();
    assert_eq!(
        frames,
        vec![json!({"type": "message", "content": "hi", "token": GOOD_TOKEN})]
    );
}

#[tokio::test]
async fn reserved_close_code_is_unauthorized_without_retry() {
    let (addr, _) = spawn_backend().await;
    let (mut streaming, mut signals) =
        StreamingTransport::new(config_for(addr), Arc::new(TungsteniteConnector));

    streaming.connect(None, Some("stale-token")).await.unwrap();
    assert_eq!(next_fault(&mut signals).await, TransportFault::Unauthorized);
    streaming.disconnect().await;
}

#[tokio::test]
async fn refused_handshake_is_unauthorized() {
    let (addr, _) = spawn_backend().await;
    let (mut streaming, mut signals) =
        StreamingTransport::new(config_for(addr), Arc::new(TungsteniteConnector));

    streaming.connect(None, None).await.unwrap();
    assert_eq!(next_fault(&mut signals).await, TransportFault::Unauthorized);
    assert!(!streaming.is_connected());
}
