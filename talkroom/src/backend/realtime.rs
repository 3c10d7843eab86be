//! Realtime change feed over the hosted service's Phoenix channel socket.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use talkroom_api::{ChangeEvent, ChangeKind};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BackendError, ChangeFeed, ChangeFilter};

const HEARTBEAT: Duration = Duration::from_secs(30);

/// Websocket endpoint derived from the project URL.
pub(super) fn socket_url(base: &Url, api_key: &str) -> Result<Url, BackendError> {
    let mut url = base
        .join("realtime/v1/websocket")
        .map_err(BackendError::decode)?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| BackendError::decode("cannot derive websocket scheme"))?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

pub(super) fn topic(filter: &ChangeFilter) -> String {
    match filter.expression() {
        Some(expr) => format!("realtime:{}:{}", filter.table, expr),
        None => format!("realtime:{}", filter.table),
    }
}

pub(super) fn join_frame(filter: &ChangeFilter, access_token: &str) -> Value {
    let event = match filter.kind {
        Some(ChangeKind::Insert) => "INSERT",
        Some(ChangeKind::Update) => "UPDATE",
        Some(ChangeKind::Delete) => "DELETE",
        None => "*",
    };
    let mut change = json!({
        "event": event,
        "schema": "public",
        "table": filter.table,
    });
    if let Some(expr) = filter.expression() {
        change["filter"] = Value::String(expr);
    }
    json!({
        "topic": topic(filter),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        },
        "ref": "1",
        "join_ref": "1",
    })
}

fn heartbeat_frame(seq: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": seq.to_string(),
    })
}

fn leave_frame(filter: &ChangeFilter) -> Value {
    json!({
        "topic": topic(filter),
        "event": "phx_leave",
        "payload": {},
        "ref": "0",
    })
}

/// Turn one socket frame into a change event, ignoring control traffic.
pub(super) fn parse_frame(text: &str) -> Option<ChangeEvent> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("event")?.as_str()? != "postgres_changes" {
        return None;
    }
    let data = frame.get("payload")?.get("data")?;
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let non_empty = |v: Option<&Value>| {
        v.filter(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
            .cloned()
    };
    Some(ChangeEvent {
        table: data.get("table")?.as_str()?.to_string(),
        kind,
        record: non_empty(data.get("record")),
        old_record: non_empty(data.get("old_record")),
    })
}

fn reply_error(text: &str) -> Option<String> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("event")?.as_str()? != "phx_reply" {
        return None;
    }
    let payload = frame.get("payload")?;
    if payload.get("status")?.as_str()? == "ok" {
        return None;
    }
    Some(payload.get("response").map(Value::to_string).unwrap_or_default())
}

/// Open a socket, join the channel and forward matching changes.
pub(super) async fn subscribe(
    socket: Url,
    access_token: &str,
    filter: ChangeFilter,
) -> Result<ChangeFeed, BackendError> {
    let (ws, _) = connect_async(socket.as_str())
        .await
        .map_err(BackendError::transport)?;
    let (mut sink, mut stream) = ws.split();
    sink.send(WsMessage::Text(join_frame(&filter, access_token).to_string()))
        .await
        .map_err(BackendError::transport)?;

    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        let mut beat = interval(HEARTBEAT);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq = 1u64;
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = sink.send(WsMessage::Text(leave_frame(&filter).to_string())).await;
                    let _ = sink.close().await;
                    break;
                }
                _ = beat.tick() => {
                    seq += 1;
                    if sink.send(WsMessage::Text(heartbeat_frame(seq).to_string())).await.is_err() {
                        tracing::warn!(topic = %topic(&filter), "realtime heartbeat failed");
                        break;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(err) = reply_error(&text) {
                            tracing::warn!(topic = %topic(&filter), %err, "realtime join rejected");
                            break;
                        }
                        if let Some(ev) = parse_frame(&text) {
                            if filter.matches(&ev) && tx.send(ev).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(topic = %topic(&filter), error = %e, "realtime socket error");
                        break;
                    }
                },
            }
        }
        tracing::debug!(topic = %topic(&filter), "realtime channel closed");
    });
    Ok(ChangeFeed::new(rx, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_switches_scheme() {
        let base = Url::parse("https://proj.example.co/").unwrap();
        let url = socket_url(&base, "anon").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://proj.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn join_frame_scopes_to_filter() {
        let filter = ChangeFilter::inserts("messages").where_eq("room_id", "r1");
        let frame = join_frame(&filter, "tok");
        assert_eq!(frame["event"], "phx_join");
        let change = &frame["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["filter"], "room_id=eq.r1");
        assert_eq!(frame["payload"]["access_token"], "tok");
    }

    #[test]
    fn parses_change_frames_only() {
        let text = r#"{"topic":"realtime:messages","event":"postgres_changes","payload":{"data":{"table":"messages","type":"INSERT","record":{"id":"m1","room_id":"r1"},"old_record":{}}},"ref":null}"#;
        let ev = parse_frame(text).unwrap();
        assert_eq!(ev.kind, ChangeKind::Insert);
        assert_eq!(ev.record.unwrap()["id"], "m1");
        assert!(ev.old_record.is_none());
        let reply = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#;
        assert!(parse_frame(reply).is_none());
        assert!(reply_error(reply).is_none());
    }

    #[test]
    fn rejected_join_is_reported() {
        let reply = r#"{"topic":"realtime:messages","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert!(reply_error(reply).unwrap().contains("unauthorized"));
    }
}
