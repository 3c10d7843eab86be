use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Account as known to the auth service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

/// Signed-in state. Passed explicitly to every call that acts as the user.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    pub user: AuthUser,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    /// True when the access token expires within `window` from now.
    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at - OffsetDateTime::now_utc() < window
    }
}

/// Persists the current session between CLI invocations.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("session.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<Session>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`load`](Self::load) but a missing session is an error.
    pub async fn require(&self) -> Result<Session> {
        self.load().await?.ok_or(ChatError::NotSignedIn)
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(session)?).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_in: Duration) -> Session {
        Session {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            user: AuthUser {
                id: Uuid::new_v4(),
                email: Some("a@example.com".into()),
            },
        }
    }

    #[test]
    fn debug_redacts_tokens() {
        let out = format!("{:?}", session(Duration::hours(1)));
        assert!(!out.contains("access\""));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn expiry_window() {
        let s = session(Duration::seconds(30));
        assert!(s.expires_within(Duration::minutes(1)));
        assert!(!s.expires_within(Duration::seconds(5)));
    }

    #[tokio::test]
    async fn store_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(store.load().await.unwrap().is_none());
        assert!(matches!(store.require().await, Err(ChatError::NotSignedIn)));
        let s = session(Duration::hours(1));
        store.save(&s).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.user, s.user);
        assert_eq!(loaded.expires_at.unix_timestamp(), s.expires_at.unix_timestamp());
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
