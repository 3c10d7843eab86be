use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub const ROOMS_TABLE: &str = "chat_rooms";
pub const MEMBERS_TABLE: &str = "chat_room_members";
pub const MESSAGES_TABLE: &str = "messages";
pub const PROFILES_TABLE: &str = "profiles";

/// Course names a student profile may carry.
pub const COURSE_NAMES: [&str; 9] = [
    "機械システムコース",
    "メカトロニクスコース",
    "電子情報コース",
    "環境物質化学コース",
    "都市環境コース",
    "エネルギー機械コース",
    "プロダクトデザインコース",
    "エレクトロニクスコース",
    "知能情報コース",
];

/// Denormalized author/member profile attached to rows.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ProfileSnapshot {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileSnapshot {
    /// Name to show for this user, falling back to a short id.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.id.simple().to_string()[..8].to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatRoom {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub invite_code: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub name: String,
    pub icon_url: Option<String>,
    pub invite_code: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatRoomMember {
    pub room_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ProfileSnapshot>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub room_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ProfileSnapshot>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
}

/// Affiliation stored on a profile. The wire values are the ones the
/// hosted tables already contain.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    #[serde(rename = "教職員")]
    Faculty,
    #[serde(rename = "学生")]
    Student,
    #[serde(rename = "その他")]
    Other,
}

impl std::str::FromStr for Affiliation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "faculty" | "staff" | "教職員" => Ok(Self::Faculty),
            "student" | "学生" => Ok(Self::Student),
            "other" | "その他" => Ok(Self::Other),
            _ => Err(format!("unknown affiliation: {s}")),
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Faculty => "faculty",
            Self::Student => "student",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub affiliation_type: Option<Affiliation>,
    #[serde(default)]
    pub student_year: Option<u8>,
    #[serde(default)]
    pub student_course: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl UserProfile {
    /// An empty profile for a freshly registered account.
    pub fn blank(id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            id,
            name: None,
            avatar_url: None,
            affiliation_type: None,
            student_year: None,
            student_course: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            id: self.id,
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Body of `POST /api/chat/join`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    #[serde(rename = "inviteCode")]
    pub invite_code: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct JoinResponse {
    #[serde(rename = "roomId")]
    pub room_id: Uuid,
}

/// Body of `POST /api/delete-account`. The id is optional on the wire so
/// that a missing value can be reported as a client error.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct DeleteAccountRequest {
    #[serde(rename = "userId", default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeleteAccountResponse {
    pub success: bool,
    pub message: String,
}

/// Error object returned by the first-party endpoints.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

/// Kind of row change delivered by the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row change as delivered to subscribers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// Id of the affected row, taken from the new record or the old one.
    pub fn row_id(&self) -> Option<Uuid> {
        self.record
            .as_ref()
            .or(self.old_record.as_ref())
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_row_parses_without_profile() {
        let row = json!({
            "id": "6f1c1a43-2a5b-4e0a-9d0f-1c3b7b8d2e11",
            "room_id": "0b7e7a51-1111-4c1e-8a3a-2b9f4a6d7c01",
            "user_id": "a3c4f2d1-2222-4b7e-9f1a-7d3e5c6b8a02",
            "content": "hello",
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        });
        let msg: Message = serde_json::from_value(row).unwrap();
        assert_eq!(msg.content, "hello");
        assert!(msg.user.is_none());
        let back = serde_json::to_value(&msg).unwrap();
        assert!(back.get("user").is_none());
    }

    #[test]
    fn affiliation_uses_stored_values() {
        let v = serde_json::to_value(Affiliation::Student).unwrap();
        assert_eq!(v, json!("学生"));
        assert_eq!("staff".parse::<Affiliation>().unwrap(), Affiliation::Faculty);
        assert!("robot".parse::<Affiliation>().is_err());
    }

    #[test]
    fn endpoint_bodies_use_camel_case() {
        let req: JoinRequest = serde_json::from_value(json!({"inviteCode": "abc"})).unwrap();
        assert_eq!(req.invite_code, "abc");
        let del: DeleteAccountRequest = serde_json::from_value(json!({})).unwrap();
        assert!(del.user_id.is_none());
    }

    #[test]
    fn change_event_row_id_prefers_new_record() {
        let id = Uuid::new_v4();
        let ev = ChangeEvent {
            table: MESSAGES_TABLE.into(),
            kind: ChangeKind::Delete,
            record: None,
            old_record: Some(json!({"id": id.to_string()})),
        };
        assert_eq!(ev.row_id(), Some(id));
    }
}
