use std::collections::HashMap;

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use async_trait::async_trait;
use bytes::Bytes;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use talkroom_api::{ChangeEvent, ChangeKind, MEMBERS_TABLE, MESSAGES_TABLE, ROOMS_TABLE};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{
    Backend, BackendError, ChangeFeed, ChangeFilter, Credential, OAuthProvider, Query, SignUp,
    UserChanges,
};
use crate::session::{AuthUser, Session};

const ACCESS_TOKEN_TTL: Duration = Duration::hours(1);

/// Columns that must be unique per table.
fn unique_keys(table: &str) -> &'static [&'static [&'static str]] {
    match table {
        ROOMS_TABLE => &[&["id"], &["invite_code"]],
        MEMBERS_TABLE => &[&["room_id", "user_id"]],
        _ => &[&["id"]],
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    exp: usize,
}

struct Account {
    email: String,
    password_hash: String,
}

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    refresh_tokens: HashMap<String, Uuid>,
    tables: HashMap<String, Vec<Value>>,
    objects: HashMap<String, (Bytes, String)>,
    reset_requests: Vec<String>,
    last_timestamp: Option<OffsetDateTime>,
}

impl State {
    /// Strictly increasing clock so rows inserted back to back keep their order.
    fn next_timestamp(&mut self) -> String {
        let mut now = OffsetDateTime::now_utc();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now.format(&Rfc3339).unwrap_or_default()
    }

    fn account_by_email(&self, email: &str) -> Option<(Uuid, &Account)> {
        self.accounts
            .iter()
            .find(|(_, a)| a.email.eq_ignore_ascii_case(email))
            .map(|(id, a)| (*id, a))
    }
}

/// In-process backend with the same observable behaviour as the hosted one:
/// unique constraints, default columns, token-checked access and a change
/// feed. Used for local runs and tests.
pub struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<ChangeEvent>,
    jwt_secret: Vec<u8>,
    require_email_confirmation: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let (events, _rx) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
            jwt_secret: secret,
            require_email_confirmation: false,
        }
    }

    /// Sign-ups return no session until the address is confirmed.
    pub fn with_email_confirmation(mut self) -> Self {
        self.require_email_confirmation = true;
        self
    }

    /// Addresses a password reset was requested for, oldest first.
    pub fn reset_requests(&self) -> Vec<String> {
        self.state.lock().reset_requests.clone()
    }

    /// Number of rows currently stored in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<(Bytes, String)> {
        self.state
            .lock()
            .objects
            .get(&format!("{bucket}/{path}"))
            .cloned()
    }

    fn issue_session(&self, state: &mut State, user_id: Uuid) -> Result<Session, BackendError> {
        let email = state.accounts.get(&user_id).map(|a| a.email.clone());
        let expires_at = OffsetDateTime::now_utc() + ACCESS_TOKEN_TTL;
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.clone(),
            exp: expires_at.unix_timestamp() as usize,
        };
        let access_token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| BackendError::new(500, "token", e.to_string()))?;
        let refresh_token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        state.refresh_tokens.insert(refresh_token.clone(), user_id);
        Ok(Session {
            access_token,
            refresh_token,
            expires_at,
            user: AuthUser { id: user_id, email },
        })
    }

    fn verify_token(&self, token: &str) -> Result<Uuid, BackendError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &DecodingKey::from_secret(&self.jwt_secret), &validation)
            .map_err(|e| BackendError::unauthorized(e.to_string()))?;
        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| BackendError::unauthorized("invalid subject"))?;
        if !self.state.lock().accounts.contains_key(&id) {
            return Err(BackendError::unauthorized("user not found"));
        }
        Ok(id)
    }

    fn authorize(&self, cred: Credential<'_>) -> Result<(), BackendError> {
        match cred {
            Credential::Service => Ok(()),
            Credential::User(session) => self.verify_token(&session.access_token).map(|_| ()),
            Credential::Token(token) => self.verify_token(token).map(|_| ()),
            Credential::Anon => Err(BackendError::unauthorized("authentication required")),
        }
    }

    fn publish(&self, table: &str, kind: ChangeKind, record: Option<Value>, old: Option<Value>) {
        // no receivers is fine
        let _ = self.events.send(ChangeEvent {
            table: table.to_string(),
            kind,
            record,
            old_record: old,
        });
    }
}

fn hash_password(password: &str) -> Result<String, BackendError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| BackendError::new(500, "hash", e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

fn invite_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Fill the columns the hosted schema defaults.
fn with_defaults(state: &mut State, table: &str, row: Value) -> Result<Value, BackendError> {
    let Value::Object(mut obj) = row else {
        return Err(BackendError::new(400, "PGRST102", "row must be a JSON object"));
    };
    fn set_default(obj: &mut Map<String, Value>, key: &str, value: Value) {
        if obj.get(key).map(Value::is_null).unwrap_or(true) {
            obj.insert(key.to_string(), value);
        }
    }
    match table {
        ROOMS_TABLE => {
            set_default(&mut obj, "id", Value::String(Uuid::new_v4().to_string()));
            set_default(&mut obj, "created_at", Value::String(state.next_timestamp()));
            set_default(&mut obj, "invite_code", Value::String(invite_code()));
            set_default(&mut obj, "icon_url", Value::Null);
        }
        MEMBERS_TABLE => {
            set_default(&mut obj, "joined_at", Value::String(state.next_timestamp()));
        }
        MESSAGES_TABLE => {
            set_default(&mut obj, "id", Value::String(Uuid::new_v4().to_string()));
            set_default(&mut obj, "created_at", Value::String(state.next_timestamp()));
        }
        _ => {
            set_default(&mut obj, "created_at", Value::String(state.next_timestamp()));
        }
    }
    Ok(Value::Object(obj))
}

fn conflicts(existing: &[Value], row: &Value, table: &str) -> bool {
    unique_keys(table).iter().any(|cols| {
        existing.iter().any(|other| {
            cols.iter()
                .all(|c| row.get(*c).is_some() && row.get(*c) == other.get(*c))
        })
    })
}

fn check_references(state: &State, table: &str, row: &Value) -> Result<(), BackendError> {
    if table != MEMBERS_TABLE && table != MESSAGES_TABLE {
        return Ok(());
    }
    let room_id = row.get("room_id");
    let exists = state
        .tables
        .get(ROOMS_TABLE)
        .map(|rooms| rooms.iter().any(|r| r.get("id") == room_id))
        .unwrap_or(false);
    if exists {
        Ok(())
    } else {
        Err(BackendError::new(
            409,
            BackendError::FOREIGN_KEY_VIOLATION,
            format!("insert on table \"{table}\" violates foreign key constraint"),
        ))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, BackendError> {
        let hash = hash_password(password)?;
        let mut state = self.state.lock();
        if state.account_by_email(email).is_some() {
            return Err(BackendError::new(422, "user_already_exists", "User already registered"));
        }
        let id = Uuid::new_v4();
        state.accounts.insert(
            id,
            Account {
                email: email.to_string(),
                password_hash: hash,
            },
        );
        let user = AuthUser {
            id,
            email: Some(email.to_string()),
        };
        let session = if self.require_email_confirmation {
            None
        } else {
            Some(self.issue_session(&mut state, id)?)
        };
        Ok(SignUp { user, session })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let mut state = self.state.lock();
        let (id, ok) = match state.account_by_email(email) {
            Some((id, account)) => (id, verify_password(password, &account.password_hash)),
            None => (Uuid::nil(), false),
        };
        if !ok {
            return Err(BackendError::new(400, "invalid_credentials", "Invalid login credentials"));
        }
        self.issue_session(&mut state, id)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, BackendError> {
        let mut state = self.state.lock();
        let id = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| BackendError::new(400, "refresh_token_not_found", "Invalid Refresh Token"))?;
        if !state.accounts.contains_key(&id) {
            return Err(BackendError::new(404, "user_not_found", "User not found"));
        }
        self.issue_session(&mut state, id)
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        let id = self.verify_token(access_token)?;
        let state = self.state.lock();
        let email = state.accounts.get(&id).map(|a| a.email.clone());
        Ok(AuthUser { id, email })
    }

    async fn update_user(
        &self,
        session: &Session,
        changes: &UserChanges,
    ) -> Result<AuthUser, BackendError> {
        let id = self.verify_token(&session.access_token)?;
        let hash = match &changes.password {
            Some(p) => Some(hash_password(p)?),
            None => None,
        };
        let mut state = self.state.lock();
        if let Some(email) = &changes.email {
            if let Some((other, _)) = state.account_by_email(email) {
                if other != id {
                    return Err(BackendError::new(422, "email_exists", "Email address already registered"));
                }
            }
        }
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| BackendError::new(404, "user_not_found", "User not found"))?;
        if let Some(email) = &changes.email {
            account.email = email.clone();
        }
        if let Some(hash) = hash {
            account.password_hash = hash;
        }
        Ok(AuthUser {
            id,
            email: Some(account.email.clone()),
        })
    }

    async fn reset_password_for_email(
        &self,
        email: &str,
        _redirect_to: Option<&str>,
    ) -> Result<(), BackendError> {
        // unknown addresses are accepted silently, like the hosted service
        self.state.lock().reset_requests.push(email.to_string());
        Ok(())
    }

    fn authorize_url(&self, provider: OAuthProvider, redirect_to: &str) -> Result<Url, BackendError> {
        Url::parse_with_params(
            "memory://auth/authorize",
            &[("provider", provider.as_str()), ("redirect_to", redirect_to)],
        )
        .map_err(BackendError::decode)
    }

    async fn sign_out(&self, session: &Session) -> Result<(), BackendError> {
        let id = self.verify_token(&session.access_token)?;
        self.state.lock().refresh_tokens.retain(|_, uid| *uid != id);
        Ok(())
    }

    async fn admin_delete_user(&self, user_id: Uuid) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.accounts.remove(&user_id).is_none() {
            return Err(BackendError::new(404, "user_not_found", "User not found"));
        }
        state.refresh_tokens.retain(|_, uid| *uid != user_id);
        Ok(())
    }

    async fn select(&self, cred: Credential<'_>, query: &Query) -> Result<Vec<Value>, BackendError> {
        self.authorize(cred)?;
        let state = self.state.lock();
        let rows = state.tables.get(&query.table).cloned().unwrap_or_default();
        Ok(query.apply(rows))
    }

    async fn insert(
        &self,
        cred: Credential<'_>,
        table: &str,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, BackendError> {
        self.authorize(cred)?;
        let stored = {
            let mut state = self.state.lock();
            let mut prepared = Vec::with_capacity(rows.len());
            for row in rows {
                let row = with_defaults(&mut state, table, row)?;
                check_references(&state, table, &row)?;
                let existing = state.tables.get(table).map(Vec::as_slice).unwrap_or(&[]);
                if conflicts(existing, &row, table) || conflicts(&prepared, &row, table) {
                    return Err(BackendError::new(
                        409,
                        BackendError::UNIQUE_VIOLATION,
                        format!("duplicate key value violates unique constraint on \"{table}\""),
                    ));
                }
                prepared.push(row);
            }
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .extend(prepared.iter().cloned());
            prepared
        };
        for row in &stored {
            self.publish(table, ChangeKind::Insert, Some(row.clone()), None);
        }
        Ok(stored)
    }

    async fn update(
        &self,
        cred: Credential<'_>,
        query: &Query,
        patch: Value,
    ) -> Result<Vec<Value>, BackendError> {
        self.authorize(cred)?;
        let Value::Object(patch) = patch else {
            return Err(BackendError::new(400, "PGRST102", "patch must be a JSON object"));
        };
        let changed = {
            let mut state = self.state.lock();
            let Some(rows) = state.tables.get_mut(&query.table) else {
                return Ok(Vec::new());
            };
            let mut changed = Vec::new();
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                let old = row.clone();
                if let Value::Object(obj) = row {
                    for (k, v) in &patch {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                changed.push((old, row.clone()));
            }
            changed
        };
        for (old, new) in &changed {
            self.publish(&query.table, ChangeKind::Update, Some(new.clone()), Some(old.clone()));
        }
        Ok(changed.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, cred: Credential<'_>, query: &Query) -> Result<Vec<Value>, BackendError> {
        self.authorize(cred)?;
        let removed = {
            let mut state = self.state.lock();
            let Some(rows) = state.tables.get_mut(&query.table) else {
                return Ok(Vec::new());
            };
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|r| query.matches(r));
            *rows = kept;
            removed
        };
        for row in &removed {
            self.publish(&query.table, ChangeKind::Delete, None, Some(row.clone()));
        }
        Ok(removed)
    }

    async fn upload(
        &self,
        cred: Credential<'_>,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), BackendError> {
        self.authorize(cred)?;
        let key = format!("{bucket}/{path}");
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(BackendError::new(409, "Duplicate", "The resource already exists"));
        }
        state.objects.insert(key, (data, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://storage/{bucket}/{path}")
    }

    async fn subscribe(
        &self,
        cred: Credential<'_>,
        filter: ChangeFilter,
    ) -> Result<ChangeFeed, BackendError> {
        self.authorize(cred)?;
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    ev = events.recv() => match ev {
                        Ok(ev) if filter.matches(&ev) => {
                            if tx.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "change feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(ChangeFeed::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn signed_in(backend: &MemoryBackend, email: &str) -> Session {
        backend.sign_up(email, "secret1").await.unwrap().session.unwrap()
    }

    #[tokio::test]
    async fn credentials_are_checked() {
        let backend = MemoryBackend::new();
        backend.sign_up("a@example.com", "secret1").await.unwrap();
        let err = backend
            .sign_in_with_password("a@example.com", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        let session = backend
            .sign_in_with_password("A@example.com", "secret1")
            .await
            .unwrap();
        let user = backend.get_user(&session.access_token).await.unwrap();
        assert_eq!(user.id, session.user.id);
        assert!(backend.get_user("garbage").await.unwrap_err().is_unauthorized());
    }

    #[tokio::test]
    async fn refresh_tokens_rotate() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend, "a@example.com").await;
        let next = backend.refresh_session(&session.refresh_token).await.unwrap();
        assert_eq!(next.user.id, session.user.id);
        assert!(backend.refresh_session(&session.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn email_confirmation_withholds_session() {
        let backend = MemoryBackend::new().with_email_confirmation();
        let out = backend.sign_up("a@example.com", "secret1").await.unwrap();
        assert!(out.session.is_none());
        assert!(backend.sign_up("a@example.com", "secret1").await.is_err());
    }

    #[tokio::test]
    async fn inserts_fill_defaults_and_enforce_uniqueness() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend, "a@example.com").await;
        let cred = Credential::from(&session);
        let rooms = backend
            .insert(cred, ROOMS_TABLE, vec![json!({"name": "r"})])
            .await
            .unwrap();
        let room_id = rooms[0]["id"].as_str().unwrap().to_string();
        assert!(rooms[0]["invite_code"].as_str().unwrap().len() == 12);
        let member = json!({"room_id": room_id, "user_id": session.user.id});
        backend
            .insert(cred, MEMBERS_TABLE, vec![member.clone()])
            .await
            .unwrap();
        let err = backend
            .insert(cred, MEMBERS_TABLE, vec![member])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        let orphan = json!({"room_id": Uuid::new_v4(), "user_id": session.user.id});
        let err = backend.insert(cred, MEMBERS_TABLE, vec![orphan]).await.unwrap_err();
        assert_eq!(err.code, BackendError::FOREIGN_KEY_VIOLATION);
    }

    #[tokio::test]
    async fn anonymous_table_access_is_rejected() {
        let backend = MemoryBackend::new();
        let err = backend
            .select(Credential::Anon, &Query::table(ROOMS_TABLE))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert!(backend
            .select(Credential::Service, &Query::table(ROOMS_TABLE))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_publish_changes() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend, "a@example.com").await;
        let cred = Credential::from(&session);
        let mut feed = backend
            .subscribe(cred, ChangeFilter::all(ROOMS_TABLE))
            .await
            .unwrap();
        let rooms = backend
            .insert(cred, ROOMS_TABLE, vec![json!({"name": "before"})])
            .await
            .unwrap();
        let id = rooms[0]["id"].as_str().unwrap();
        let q = Query::table(ROOMS_TABLE).eq("id", id);
        let updated = backend
            .update(cred, &q, json!({"name": "after"}))
            .await
            .unwrap();
        assert_eq!(updated[0]["name"], "after");
        assert_eq!(backend.delete(cred, &q).await.unwrap().len(), 1);
        let kinds: Vec<ChangeKind> = vec![
            feed.recv().await.unwrap().kind,
            feed.recv().await.unwrap().kind,
            feed.recv().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
        assert_eq!(backend.row_count(ROOMS_TABLE), 0);
    }

    #[tokio::test]
    async fn uploads_do_not_overwrite() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend, "a@example.com").await;
        let cred = Credential::from(&session);
        backend
            .upload(cred, "avatars", "a.png", Bytes::from_static(b"x"), "image/png")
            .await
            .unwrap();
        assert!(backend
            .upload(cred, "avatars", "a.png", Bytes::from_static(b"y"), "image/png")
            .await
            .is_err());
        assert_eq!(backend.object("avatars", "a.png").unwrap().1, "image/png");
        assert_eq!(backend.public_url("avatars", "a.png"), "memory://storage/avatars/a.png");
    }

    #[tokio::test]
    async fn deleted_users_lose_access() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend, "a@example.com").await;
        backend.admin_delete_user(session.user.id).await.unwrap();
        assert!(backend.get_user(&session.access_token).await.is_err());
        assert!(backend.admin_delete_user(session.user.id).await.is_err());
    }
}
