use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use talkroom_api::{
    ChatRoom, ChatRoomMember, NewMember, NewRoom, MEMBERS_TABLE, MESSAGES_TABLE, ROOMS_TABLE,
};
use uuid::Uuid;

use crate::backend::{insert_row, select_optional, select_rows, Backend, Credential, Query};
use crate::error::{ChatError, Result};
use crate::files::{self, ImageUpload, ROOM_ICONS_BUCKET};
use crate::profiles;
use crate::session::Session;

const INVITE_CODE_LEN: usize = 12;

/// A freshly created room and the link that lets others join it.
#[derive(Debug, Clone)]
pub struct CreatedRoom {
    pub room: ChatRoom,
    pub invite_link: String,
}

pub fn generate_invite_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITE_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Link a recipient opens to join: `{base}/chat/join/{code}`.
pub fn invite_link(base_url: &str, code: &str) -> String {
    format!("{}/chat/join/{}", base_url.trim_end_matches('/'), code)
}

fn room_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::validation("room name is required"));
    }
    Ok(name.to_string())
}

pub async fn get(backend: &dyn Backend, cred: Credential<'_>, room_id: Uuid) -> Result<ChatRoom> {
    let query = Query::table(ROOMS_TABLE).eq("id", room_id);
    select_optional(backend, cred, &query)
        .await?
        .ok_or(ChatError::NotFound)
}

/// Rooms the user belongs to, oldest first.
pub async fn list_for_user(backend: &dyn Backend, session: &Session) -> Result<Vec<ChatRoom>> {
    let cred = Credential::User(session);
    let memberships: Vec<ChatRoomMember> = select_rows(
        backend,
        cred,
        &Query::table(MEMBERS_TABLE).eq("user_id", session.user_id()),
    )
    .await?;
    if memberships.is_empty() {
        return Ok(Vec::new());
    }
    let query = Query::table(ROOMS_TABLE)
        .in_list("id", memberships.iter().map(|m| m.room_id))
        .order("created_at", true);
    Ok(select_rows(backend, cred, &query).await?)
}

pub async fn create(
    backend: &dyn Backend,
    session: &Session,
    name: &str,
    icon: Option<ImageUpload>,
    site_url: &str,
) -> Result<CreatedRoom> {
    let name = room_name(name)?;
    let cred = Credential::User(session);
    let icon_url = match icon {
        Some(upload) => Some(files::store_image(backend, session, ROOM_ICONS_BUCKET, upload).await?),
        None => None,
    };
    let room: ChatRoom = insert_row(
        backend,
        cred,
        ROOMS_TABLE,
        &NewRoom {
            name,
            icon_url,
            invite_code: generate_invite_code(),
        },
    )
    .await?;

    let member = NewMember {
        room_id: room.id,
        user_id: session.user_id(),
    };
    if let Err(e) = insert_row::<_, ChatRoomMember>(backend, cred, MEMBERS_TABLE, &member).await {
        tracing::warn!(room = %room.id, error = %e, "adding creator failed, removing room");
        let cleanup = Query::table(ROOMS_TABLE).eq("id", room.id);
        if let Err(del) = backend.delete(cred, &cleanup).await {
            tracing::error!(room = %room.id, error = %del, "orphaned room left behind");
        }
        return Err(e.into());
    }

    tracing::info!(room = %room.id, "room created");
    let invite_link = invite_link(site_url, &room.invite_code);
    Ok(CreatedRoom { room, invite_link })
}

/// Join the room behind `code` as `user_id`.
pub async fn join_as(
    backend: &dyn Backend,
    cred: Credential<'_>,
    user_id: Uuid,
    code: &str,
    membership_limit: Option<usize>,
) -> Result<Uuid> {
    let code = code.trim();
    if code.is_empty() {
        return Err(ChatError::InvalidInviteCode);
    }
    let room: ChatRoom = select_optional(
        backend,
        cred,
        &Query::table(ROOMS_TABLE).eq("invite_code", code),
    )
    .await?
    .ok_or(ChatError::InvalidInviteCode)?;

    let memberships: Vec<ChatRoomMember> = select_rows(
        backend,
        cred,
        &Query::table(MEMBERS_TABLE).eq("user_id", user_id),
    )
    .await?;
    if memberships.iter().any(|m| m.room_id == room.id) {
        return Err(ChatError::AlreadyMember(room.id));
    }
    if let Some(limit) = membership_limit {
        if memberships.len() >= limit {
            return Err(ChatError::MembershipLimit(limit));
        }
    }

    let member = NewMember {
        room_id: room.id,
        user_id,
    };
    match insert_row::<_, ChatRoomMember>(backend, cred, MEMBERS_TABLE, &member).await {
        Ok(_) => {
            tracing::info!(room = %room.id, user = %user_id, "joined room");
            Ok(room.id)
        }
        Err(e) if e.is_unique_violation() => Err(ChatError::AlreadyMember(room.id)),
        Err(e) => Err(e.into()),
    }
}

pub async fn join_by_code(
    backend: &dyn Backend,
    session: &Session,
    code: &str,
    membership_limit: Option<usize>,
) -> Result<Uuid> {
    join_as(
        backend,
        Credential::User(session),
        session.user_id(),
        code,
        membership_limit,
    )
    .await
}

async fn is_member(backend: &dyn Backend, session: &Session, room_id: Uuid) -> Result<bool> {
    let query = Query::table(MEMBERS_TABLE)
        .eq("room_id", room_id)
        .eq("user_id", session.user_id());
    Ok(!backend
        .select(Credential::User(session), &query)
        .await?
        .is_empty())
}

pub async fn rename(
    backend: &dyn Backend,
    session: &Session,
    room_id: Uuid,
    name: &str,
) -> Result<ChatRoom> {
    let name = room_name(name)?;
    if !is_member(backend, session, room_id).await? {
        return Err(ChatError::NotAMember);
    }
    let query = Query::table(ROOMS_TABLE).eq("id", room_id);
    let mut rows = backend
        .update(Credential::User(session), &query, json!({ "name": name }))
        .await?;
    if rows.is_empty() {
        return Err(ChatError::NotFound);
    }
    Ok(serde_json::from_value(rows.remove(0))?)
}

/// Leave a room. The last member out deletes the room and its messages.
/// Returns whether the room was deleted.
pub async fn leave(backend: &dyn Backend, session: &Session, room_id: Uuid) -> Result<bool> {
    let cred = Credential::User(session);
    let own = Query::table(MEMBERS_TABLE)
        .eq("room_id", room_id)
        .eq("user_id", session.user_id());
    if backend.delete(cred, &own).await?.is_empty() {
        return Err(ChatError::NotAMember);
    }
    tracing::info!(room = %room_id, user = %session.user_id(), "left room");

    // count then delete; a concurrent join in between is not guarded against
    let remaining = backend
        .select(cred, &Query::table(MEMBERS_TABLE).eq("room_id", room_id))
        .await?;
    if !remaining.is_empty() {
        return Ok(false);
    }
    backend
        .delete(cred, &Query::table(MESSAGES_TABLE).eq("room_id", room_id))
        .await?;
    backend
        .delete(cred, &Query::table(ROOMS_TABLE).eq("id", room_id))
        .await?;
    tracing::info!(room = %room_id, "room deleted after last member left");
    Ok(true)
}

/// Members of a room with their profile snapshots, by join time.
pub async fn members(
    backend: &dyn Backend,
    cred: Credential<'_>,
    room_id: Uuid,
) -> Result<Vec<ChatRoomMember>> {
    let query = Query::table(MEMBERS_TABLE)
        .eq("room_id", room_id)
        .order("joined_at", true);
    let mut members: Vec<ChatRoomMember> = select_rows(backend, cred, &query).await?;
    let ids: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();
    let mut snaps = profiles::snapshots(backend, cred, &ids).await?;
    for m in &mut members {
        m.user = snaps.remove(&m.user_id);
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::messages;
    use bytes::Bytes;

    const SITE: &str = "http://localhost:3000";

    async fn user(backend: &MemoryBackend, email: &str) -> Session {
        backend.sign_up(email, "secret1").await.unwrap().session.unwrap()
    }

    #[test]
    fn invite_links() {
        assert_eq!(
            invite_link("https://chat.example/", "abc"),
            "https://chat.example/chat/join/abc"
        );
        assert_eq!(generate_invite_code().len(), INVITE_CODE_LEN);
    }

    #[tokio::test]
    async fn create_adds_creator_and_icon() {
        let backend = MemoryBackend::new();
        let alice = user(&backend, "alice@example.com").await;
        let icon = files::validate_image(
            "icon.png",
            Bytes::from_static(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]),
            1024,
        )
        .unwrap();
        let created = create(&backend, &alice, "  Lab  ", Some(icon), SITE).await.unwrap();
        assert_eq!(created.room.name, "Lab");
        assert!(created
            .invite_link
            .ends_with(&format!("/chat/join/{}", created.room.invite_code)));
        let icon_url = created.room.icon_url.unwrap();
        assert!(icon_url.starts_with("memory://storage/room-icons/"));

        let rooms = list_for_user(&backend, &alice).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert!(create(&backend, &alice, "   ", None, SITE).await.is_err());
    }

    #[tokio::test]
    async fn join_rules() {
        let backend = MemoryBackend::new();
        let alice = user(&backend, "alice@example.com").await;
        let bob = user(&backend, "bob@example.com").await;
        let room = create(&backend, &alice, "Lab", None, SITE).await.unwrap().room;

        let before = backend.row_count(MEMBERS_TABLE);
        assert!(matches!(
            join_by_code(&backend, &bob, "no-such-code", Some(5)).await,
            Err(ChatError::InvalidInviteCode)
        ));
        assert_eq!(backend.row_count(MEMBERS_TABLE), before);

        let joined = join_by_code(&backend, &bob, &room.invite_code, Some(5))
            .await
            .unwrap();
        assert_eq!(joined, room.id);
        assert!(matches!(
            join_by_code(&backend, &bob, &room.invite_code, Some(5)).await,
            Err(ChatError::AlreadyMember(id)) if id == room.id
        ));
        let names: Vec<_> = members(&backend, Credential::User(&alice), room.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(names, vec![alice.user_id(), bob.user_id()]);
    }

    #[tokio::test]
    async fn membership_limit_blocks_sixth_room() {
        let backend = MemoryBackend::new();
        let owner = user(&backend, "owner@example.com").await;
        let carol = user(&backend, "carol@example.com").await;
        for i in 0..5 {
            create(&backend, &carol, &format!("room {i}"), None, SITE)
                .await
                .unwrap();
        }
        let sixth = create(&backend, &owner, "sixth", None, SITE).await.unwrap().room;
        assert!(matches!(
            join_by_code(&backend, &carol, &sixth.invite_code, Some(5)).await,
            Err(ChatError::MembershipLimit(5))
        ));
        assert!(join_by_code(&backend, &carol, &sixth.invite_code, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rename_requires_membership() {
        let backend = MemoryBackend::new();
        let alice = user(&backend, "alice@example.com").await;
        let mallory = user(&backend, "mallory@example.com").await;
        let room = create(&backend, &alice, "Lab", None, SITE).await.unwrap().room;
        assert!(matches!(
            rename(&backend, &mallory, room.id, "Mine").await,
            Err(ChatError::NotAMember)
        ));
        let renamed = rename(&backend, &alice, room.id, "Seminar").await.unwrap();
        assert_eq!(renamed.name, "Seminar");
        assert_eq!(renamed.invite_code, room.invite_code);
    }

    #[tokio::test]
    async fn last_member_leaving_deletes_room_and_messages() {
        let backend = MemoryBackend::new();
        let alice = user(&backend, "alice@example.com").await;
        let bob = user(&backend, "bob@example.com").await;
        let room = create(&backend, &alice, "Lab", None, SITE).await.unwrap().room;
        join_by_code(&backend, &bob, &room.invite_code, None)
            .await
            .unwrap();
        messages::send(&backend, &alice, room.id, "hi", Default::default())
            .await
            .unwrap();

        assert!(!leave(&backend, &alice, room.id).await.unwrap());
        assert_eq!(backend.row_count(ROOMS_TABLE), 1);
        assert!(matches!(
            leave(&backend, &alice, room.id).await,
            Err(ChatError::NotAMember)
        ));

        assert!(leave(&backend, &bob, room.id).await.unwrap());
        assert_eq!(backend.row_count(ROOMS_TABLE), 0);
        assert_eq!(backend.row_count(MESSAGES_TABLE), 0);
        assert!(list_for_user(&backend, &bob).await.unwrap().is_empty());
    }
}
