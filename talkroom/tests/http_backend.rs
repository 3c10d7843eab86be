use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use talkroom::backend::{Backend, ChangeFilter, Credential, HttpBackend, Query};
use talkroom_api::{ChangeKind, MESSAGES_TABLE};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(HeaderMap, Option<String>)>>>,
}

async fn list_messages(
    State(seen): State<Seen>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Json<Value> {
    seen.requests.lock().push((headers, query));
    Json(json!([{ "id": "11111111-1111-1111-1111-111111111111", "content": "hi" }]))
}

async fn insert_message(Json(_rows): Json<Value>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::CONFLICT,
        Json(json!({ "code": "23505", "message": "duplicate key value" })),
    )
}

async fn spawn_rest(seen: Seen) -> (SocketAddr, JoinHandle<()>) {
    let app = Router::new()
        .route(
            "/rest/v1/messages",
            get(list_messages).post(insert_message),
        )
        .with_state(seen);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server)
}

fn backend_at(addr: SocketAddr) -> HttpBackend {
    HttpBackend::new(
        Url::parse(&format!("http://{addr}/")).unwrap(),
        "anon-key".into(),
        None,
    )
}

#[tokio::test]
async fn select_sends_keys_and_filters() {
    let seen = Seen::default();
    let (addr, server) = spawn_rest(seen.clone()).await;
    let backend = backend_at(addr);

    let query = Query::table(MESSAGES_TABLE)
        .eq("room_id", "r1")
        .order("created_at", false)
        .limit(50);
    let rows = backend
        .select(Credential::Token("user-token"), &query)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["content"], "hi");

    let requests = seen.requests.lock();
    let (headers, raw) = &requests[0];
    assert_eq!(headers["apikey"], "anon-key");
    assert_eq!(headers["authorization"], "Bearer user-token");
    let raw = raw.clone().unwrap_or_default();
    assert!(raw.contains("select=*"), "{raw}");
    assert!(raw.contains("room_id=eq.r1"), "{raw}");
    assert!(raw.contains("order=created_at.desc"), "{raw}");
    assert!(raw.contains("limit=50"), "{raw}");

    server.abort();
}

#[tokio::test]
async fn table_errors_keep_their_code() {
    let (addr, server) = spawn_rest(Seen::default()).await;
    let backend = backend_at(addr);

    let err = backend
        .insert(Credential::Anon, MESSAGES_TABLE, vec![json!({ "content": "x" })])
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());
    assert_eq!(err.status, 409);

    server.abort();
}

#[tokio::test]
async fn service_calls_need_a_service_key() {
    let backend = HttpBackend::new(Url::parse("http://127.0.0.1:9/").unwrap(), "anon".into(), None);
    let err = backend
        .admin_delete_user(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn realtime_forwards_matching_changes() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (leave_tx, leave_rx) = tokio::sync::oneshot::channel::<Value>();

    let socket = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let join = match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
            other => panic!("expected join frame, got {other:?}"),
        };
        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["topic"], "realtime:messages:room_id=eq.r1");
        assert_eq!(join["payload"]["access_token"], "user-token");

        let reply = json!({ "event": "phx_reply", "topic": join["topic"], "payload": { "status": "ok", "response": {} } });
        ws.send(WsMessage::Text(reply.to_string())).await.unwrap();

        let change = |room: &str, content: &str| {
            json!({
                "event": "postgres_changes",
                "topic": "realtime:messages:room_id=eq.r1",
                "payload": { "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "record": { "id": "11111111-1111-1111-1111-111111111111", "room_id": room, "content": content },
                    "old_record": {}
                }}
            })
            .to_string()
        };
        ws.send(WsMessage::Text(change("r2", "elsewhere"))).await.unwrap();
        ws.send(WsMessage::Text(change("r1", "hello"))).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["event"] == "phx_leave" {
                    let _ = leave_tx.send(frame);
                    break;
                }
            }
        }
    });

    let backend = HttpBackend::new(
        Url::parse(&format!("http://{addr}/")).unwrap(),
        "anon-key".into(),
        None,
    );
    let mut feed = backend
        .subscribe(
            Credential::Token("user-token"),
            ChangeFilter::inserts(MESSAGES_TABLE).where_eq("room_id", "r1"),
        )
        .await
        .unwrap();

    let ev = tokio::time::timeout(std::time::Duration::from_secs(5), feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.kind, ChangeKind::Insert);
    assert_eq!(ev.record.as_ref().unwrap()["content"], "hello");
    assert!(ev.old_record.is_none());

    drop(feed);
    let leave = tokio::time::timeout(std::time::Duration::from_secs(5), leave_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leave["topic"], "realtime:messages:room_id=eq.r1");
    socket.await.unwrap();
}
