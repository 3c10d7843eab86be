use std::collections::HashMap;

use serde_json::json;
use talkroom_api::{Affiliation, ProfileSnapshot, UserProfile, COURSE_NAMES, PROFILES_TABLE};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::backend::{
    insert_row, select_optional, select_rows, Backend, ChangeFeed, ChangeFilter, Credential, Query,
};
use crate::error::{ChatError, Result};
use crate::files::{self, ImageUpload, AVATARS_BUCKET};
use crate::session::Session;

/// Edits a user may make to their own profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub affiliation: Option<Affiliation>,
    pub student_year: Option<u8>,
    pub student_course: Option<String>,
}

impl ProfileUpdate {
    /// Check required fields and drop student details for non-students.
    pub fn validate(self) -> Result<ValidProfileUpdate> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ChatError::validation("name is required"))?
            .to_string();
        let affiliation = self
            .affiliation
            .ok_or_else(|| ChatError::validation("affiliation is required"))?;
        let (year, course) = if affiliation == Affiliation::Student {
            let year = self
                .student_year
                .filter(|y| (1..=4).contains(y))
                .ok_or_else(|| ChatError::validation("student year (1-4) is required"))?;
            let course = self
                .student_course
                .filter(|c| COURSE_NAMES.contains(&c.as_str()))
                .ok_or_else(|| ChatError::validation("a valid course is required"))?;
            (Some(year), Some(course))
        } else {
            (None, None)
        };
        Ok(ValidProfileUpdate {
            name,
            affiliation,
            student_year: year,
            student_course: course,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidProfileUpdate {
    pub name: String,
    pub affiliation: Affiliation,
    pub student_year: Option<u8>,
    pub student_course: Option<String>,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Load the caller's profile, creating an empty one on first use.
pub async fn fetch_or_create(backend: &dyn Backend, session: &Session) -> Result<UserProfile> {
    let cred = Credential::User(session);
    let query = Query::table(PROFILES_TABLE).eq("id", session.user_id());
    if let Some(profile) = select_optional(backend, cred, &query).await? {
        return Ok(profile);
    }
    tracing::info!(user = %session.user_id(), "creating profile");
    let blank = UserProfile::blank(session.user_id(), OffsetDateTime::now_utc());
    match insert_row(backend, cred, PROFILES_TABLE, &blank).await {
        Ok(profile) => Ok(profile),
        // created concurrently by another client
        Err(e) if e.is_unique_violation() => Ok(select_optional(backend, cred, &query)
            .await?
            .ok_or(ChatError::NotFound)?),
        Err(e) => Err(e.into()),
    }
}

pub async fn update(
    backend: &dyn Backend,
    session: &Session,
    changes: ProfileUpdate,
) -> Result<UserProfile> {
    let valid = changes.validate()?;
    fetch_or_create(backend, session).await?;
    let patch = json!({
        "name": valid.name,
        "affiliation_type": valid.affiliation,
        "student_year": valid.student_year,
        "student_course": valid.student_course,
        "updated_at": now_rfc3339(),
    });
    let query = Query::table(PROFILES_TABLE).eq("id", session.user_id());
    let mut rows = backend
        .update(Credential::User(session), &query, patch)
        .await?;
    if rows.is_empty() {
        return Err(ChatError::NotFound);
    }
    Ok(serde_json::from_value(rows.remove(0))?)
}

/// Upload a new avatar and point the profile at it.
pub async fn set_avatar(
    backend: &dyn Backend,
    session: &Session,
    upload: ImageUpload,
) -> Result<UserProfile> {
    fetch_or_create(backend, session).await?;
    let url = files::store_image(backend, session, AVATARS_BUCKET, upload).await?;
    let query = Query::table(PROFILES_TABLE).eq("id", session.user_id());
    let mut rows = backend
        .update(
            Credential::User(session),
            &query,
            json!({ "avatar_url": url, "updated_at": now_rfc3339() }),
        )
        .await?;
    if rows.is_empty() {
        return Err(ChatError::NotFound);
    }
    Ok(serde_json::from_value(rows.remove(0))?)
}

/// Subscribe to changes of the caller's own profile row.
pub async fn watch(backend: &dyn Backend, session: &Session) -> Result<ChangeFeed> {
    let filter = ChangeFilter::all(PROFILES_TABLE).where_eq("id", session.user_id());
    Ok(backend.subscribe(Credential::User(session), filter).await?)
}

/// Profile snapshots for a set of users. Users without a profile row get
/// an empty snapshot.
pub async fn snapshots(
    backend: &dyn Backend,
    cred: Credential<'_>,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, ProfileSnapshot>> {
    let mut unique: Vec<Uuid> = ids.to_vec();
    unique.sort();
    unique.dedup();
    let mut out: HashMap<Uuid, ProfileSnapshot> = unique
        .iter()
        .map(|id| {
            (
                *id,
                ProfileSnapshot {
                    id: *id,
                    ..Default::default()
                },
            )
        })
        .collect();
    if unique.is_empty() {
        return Ok(out);
    }
    let query = Query::table(PROFILES_TABLE).in_list("id", &unique);
    let profiles: Vec<UserProfile> = select_rows(backend, cred, &query).await?;
    for p in profiles {
        out.insert(p.id, p.snapshot());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    async fn signed_in(backend: &MemoryBackend) -> Session {
        backend
            .sign_up("p@example.com", "secret1")
            .await
            .unwrap()
            .session
            .unwrap()
    }

    #[test]
    fn student_fields_are_required_only_for_students() {
        let staff = ProfileUpdate {
            name: Some("  Sato ".into()),
            affiliation: Some(Affiliation::Faculty),
            student_year: Some(2),
            student_course: Some(COURSE_NAMES[0].into()),
        }
        .validate()
        .unwrap();
        assert_eq!(staff.name, "Sato");
        assert_eq!(staff.student_year, None);
        assert_eq!(staff.student_course, None);

        let student = ProfileUpdate {
            name: Some("Ito".into()),
            affiliation: Some(Affiliation::Student),
            student_year: Some(5),
            student_course: Some(COURSE_NAMES[1].into()),
        };
        assert!(student.validate().is_err());
        assert!(ProfileUpdate {
            name: Some(" ".into()),
            affiliation: Some(Affiliation::Other),
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn profile_is_created_lazily_and_updated() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let created = fetch_or_create(&backend, &session).await.unwrap();
        assert_eq!(created.id, session.user_id());
        assert!(created.name.is_none());
        let again = fetch_or_create(&backend, &session).await.unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(backend.row_count(PROFILES_TABLE), 1);

        let updated = update(
            &backend,
            &session,
            ProfileUpdate {
                name: Some("Yamada".into()),
                affiliation: Some(Affiliation::Student),
                student_year: Some(3),
                student_course: Some(COURSE_NAMES[8].into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.name.as_deref(), Some("Yamada"));
        assert_eq!(updated.student_year, Some(3));
    }

    #[tokio::test]
    async fn watch_sees_own_updates() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        fetch_or_create(&backend, &session).await.unwrap();
        let mut feed = watch(&backend, &session).await.unwrap();
        update(
            &backend,
            &session,
            ProfileUpdate {
                name: Some("New".into()),
                affiliation: Some(Affiliation::Other),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let ev = feed.recv().await.unwrap();
        assert_eq!(ev.record.unwrap()["name"], "New");
    }

    #[tokio::test]
    async fn snapshots_fill_missing_profiles() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        fetch_or_create(&backend, &session).await.unwrap();
        let stranger = Uuid::new_v4();
        let snaps = snapshots(
            &backend,
            Credential::User(&session),
            &[session.user_id(), stranger, stranger],
        )
        .await
        .unwrap();
        assert_eq!(snaps.len(), 2);
        assert!(snaps[&stranger].name.is_none());
    }
}
