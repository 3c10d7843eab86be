use talkroom_api::{Message, NewMessage, MESSAGES_TABLE};
use uuid::Uuid;

use crate::backend::{insert_row, select_optional, select_rows, Backend, Credential, Query};
use crate::codec::{self, MessageCodec};
use crate::error::Result;
use crate::profiles;
use crate::session::Session;

/// Decode content and attach author snapshots.
async fn hydrate(
    backend: &dyn Backend,
    cred: Credential<'_>,
    mut messages: Vec<Message>,
) -> Result<Vec<Message>> {
    let ids: Vec<Uuid> = messages.iter().map(|m| m.user_id).collect();
    let snaps = profiles::snapshots(backend, cred, &ids).await?;
    for m in &mut messages {
        m.content = codec::decode(&m.content);
        m.user = snaps.get(&m.user_id).cloned();
    }
    Ok(messages)
}

/// The newest `limit` messages of a room, oldest first.
pub async fn recent(
    backend: &dyn Backend,
    cred: Credential<'_>,
    room_id: Uuid,
    limit: usize,
) -> Result<Vec<Message>> {
    let query = Query::table(MESSAGES_TABLE)
        .eq("room_id", room_id)
        .order("created_at", false)
        .limit(limit);
    let mut rows: Vec<Message> = select_rows(backend, cred, &query).await?;
    rows.reverse();
    hydrate(backend, cred, rows).await
}

/// A single message with its author, `None` if it is not visible.
pub async fn fetch(backend: &dyn Backend, cred: Credential<'_>, id: Uuid) -> Result<Option<Message>> {
    let query = Query::table(MESSAGES_TABLE).eq("id", id);
    let Some(message) = select_optional::<Message>(backend, cred, &query).await? else {
        return Ok(None);
    };
    Ok(hydrate(backend, cred, vec![message]).await?.pop())
}

/// Store a message. Blank text is ignored and `None` returned without
/// contacting the backend.
pub async fn send(
    backend: &dyn Backend,
    session: &Session,
    room_id: Uuid,
    text: &str,
    codec: MessageCodec,
) -> Result<Option<Message>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let row = NewMessage {
        room_id,
        user_id: session.user_id(),
        content: codec.encode(text),
    };
    let mut stored: Message = insert_row(backend, Credential::User(session), MESSAGES_TABLE, &row).await?;
    stored.content = text.to_string();
    tracing::debug!(room = %room_id, message = %stored.id, "message sent");
    Ok(Some(stored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::rooms;

    async fn setup() -> (MemoryBackend, Session, Uuid) {
        let backend = MemoryBackend::new();
        let session = backend
            .sign_up("m@example.com", "secret1")
            .await
            .unwrap()
            .session
            .unwrap();
        let room = rooms::create(&backend, &session, "Lab", None, "http://localhost")
            .await
            .unwrap()
            .room;
        (backend, session, room.id)
    }

    #[tokio::test]
    async fn recent_returns_newest_in_ascending_order() {
        let (backend, session, room) = setup().await;
        for i in 0..5 {
            send(&backend, &session, room, &format!("m{i}"), MessageCodec::Plain)
                .await
                .unwrap();
        }
        let got = recent(&backend, Credential::User(&session), room, 3).await.unwrap();
        let texts: Vec<_> = got.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(got[0].user.as_ref().map(|u| u.id), Some(session.user_id()));
    }

    #[tokio::test]
    async fn obfuscated_messages_are_stored_encoded() {
        let (backend, session, room) = setup().await;
        let sent = send(&backend, &session, room, "  secret plan ", MessageCodec::Obfuscated)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.content, "secret plan");
        let raw = backend
            .select(
                Credential::User(&session),
                &Query::table(MESSAGES_TABLE).eq("id", sent.id),
            )
            .await
            .unwrap();
        assert!(raw[0]["content"].as_str().unwrap().ends_with(codec::MARKER));
        let fetched = fetch(&backend, Credential::User(&session), sent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.content, "secret plan");
    }

    #[tokio::test]
    async fn blank_text_is_not_sent() {
        let (backend, session, room) = setup().await;
        assert!(send(&backend, &session, room, " \n\t", MessageCodec::Plain)
            .await
            .unwrap()
            .is_none());
        assert_eq!(backend.row_count(MESSAGES_TABLE), 0);
    }
}
