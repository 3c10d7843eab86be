use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration as StdDuration,
};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::Mutex;
use url::Url;

use crate::backend::{Backend, OAuthProvider, UserChanges};
use crate::error::{ChatError, Result};
use crate::session::{AuthUser, Session};

pub const MIN_PASSWORD_LEN: usize = 6;

/// How long after a reset request the same address must wait.
pub const RESET_COOLDOWN: StdDuration = StdDuration::from_secs(5);

/// Sessions expiring within this window are refreshed before use.
const REFRESH_WINDOW: Duration = Duration::seconds(60);

static EMAIL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

pub fn validate_email(email: &str) -> Result<&str> {
    let email = email.trim();
    if EMAIL_RE.as_ref().is_some_and(|re| re.is_match(email)) {
        Ok(email)
    } else {
        Err(ChatError::validation("enter a valid email address"))
    }
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ChatError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Rate limiter keyed by an arbitrary string. With a backing file the
/// attempt history survives restarts, so separate CLI runs share it.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, Vec<i64>>>>,
    max: usize,
    window: StdDuration,
    path: Option<PathBuf>,
}

fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

impl RateLimiter {
    pub fn new(max: usize, window: StdDuration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
            path: None,
        }
    }

    /// Keep the attempt history in `path`.
    pub fn persisted(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// One request per address per [`RESET_COOLDOWN`], remembered in `data_dir`.
    pub fn password_reset(data_dir: &Path) -> Self {
        Self::new(1, RESET_COOLDOWN).persisted(data_dir.join("reset_requests.json"))
    }

    async fn load(path: &Path) -> HashMap<String, Vec<i64>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "discarding unreadable rate limit state");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    /// Returns true if the attempt is allowed, false if rate limited.
    pub async fn check(&self, key: &str) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        if let Some(path) = &self.path {
            *guard = Self::load(path).await;
        }
        let now = now_millis();
        let window = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        guard.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_sub(*t) < window);
            !attempts.is_empty()
        });
        let entry = guard.entry(key.to_ascii_lowercase()).or_default();
        if entry.len() >= self.max {
            return Ok(false);
        }
        entry.push(now);
        if let Some(path) = &self.path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).await?;
            }
            fs::write(path, serde_json::to_vec(&*guard)?).await?;
        }
        Ok(true)
    }
}

/// Result of a sign-up.
#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    SignedIn(Session),
    /// The account exists but the address must be confirmed first.
    ConfirmationPending(AuthUser),
}

pub async fn sign_up(backend: &dyn Backend, email: &str, password: &str) -> Result<SignUpOutcome> {
    let email = validate_email(email)?;
    validate_password(password)?;
    let signed = backend.sign_up(email, password).await?;
    tracing::info!(user = %signed.user.id, "account created");
    Ok(match signed.session {
        Some(session) => SignUpOutcome::SignedIn(session),
        None => SignUpOutcome::ConfirmationPending(signed.user),
    })
}

pub async fn sign_in(backend: &dyn Backend, email: &str, password: &str) -> Result<Session> {
    let email = validate_email(email)?;
    match backend.sign_in_with_password(email, password).await {
        Ok(session) => {
            tracing::info!(user = %session.user_id(), "signed in");
            Ok(session)
        }
        Err(e) if e.status == 400 => Err(ChatError::InvalidCredentials),
        Err(e) => Err(e.into()),
    }
}

/// Provider login URL; the provider redirects back to `redirect_to`.
pub fn oauth_url(backend: &dyn Backend, provider: OAuthProvider, redirect_to: &str) -> Result<Url> {
    Ok(backend.authorize_url(provider, redirect_to)?)
}

pub async fn request_password_reset(
    backend: &dyn Backend,
    limiter: &RateLimiter,
    email: &str,
    redirect_to: Option<&str>,
) -> Result<()> {
    let email = validate_email(email)?;
    if !limiter.check(email).await? {
        return Err(ChatError::RateLimited);
    }
    match backend.reset_password_for_email(email, redirect_to).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_rate_limited() => Err(ChatError::RateLimited),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

/// Expiry recorded in an access token. The signature is not checked here;
/// the token is verified remotely before it is trusted.
fn token_expiry(access_token: &str) -> Option<OffsetDateTime> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = decode::<ExpiryClaims>(access_token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    OffsetDateTime::from_unix_timestamp(data.claims.exp).ok()
}

/// Build a session from the tokens carried by a password recovery link.
/// A rejected access token falls back to the refresh token.
pub async fn session_from_reset_link(
    backend: &dyn Backend,
    access_token: &str,
    refresh_token: &str,
) -> Result<Session> {
    match backend.get_user(access_token).await {
        Ok(user) => Ok(Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            // unknown expiry forces a refresh on next use
            expires_at: token_expiry(access_token).unwrap_or_else(OffsetDateTime::now_utc),
            user,
        }),
        Err(e) if e.is_unauthorized() => {
            tracing::debug!("recovery access token rejected, refreshing");
            backend
                .refresh_session(refresh_token)
                .await
                .map_err(|_| ChatError::NotSignedIn)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn update_password(
    backend: &dyn Backend,
    session: &Session,
    new_password: &str,
    confirm: &str,
) -> Result<()> {
    if new_password != confirm {
        return Err(ChatError::validation("passwords do not match"));
    }
    validate_password(new_password)?;
    backend
        .update_user(
            session,
            &UserChanges {
                password: Some(new_password.to_string()),
                ..Default::default()
            },
        )
        .await?;
    tracing::info!(user = %session.user_id(), "password updated");
    Ok(())
}

/// Change the account email. The hosted service may hold the change until
/// the new address is confirmed, so the returned user can still carry the
/// old one.
pub async fn update_email(backend: &dyn Backend, session: &Session, new_email: &str) -> Result<AuthUser> {
    let email = validate_email(new_email)?;
    let user = backend
        .update_user(
            session,
            &UserChanges {
                email: Some(email.to_string()),
                ..Default::default()
            },
        )
        .await?;
    Ok(user)
}

pub async fn sign_out(backend: &dyn Backend, session: &Session) -> Result<()> {
    match backend.sign_out(session).await {
        Ok(()) => Ok(()),
        // an expired token is as good as signed out
        Err(e) if e.is_unauthorized() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Return a session that stays valid for at least a minute, refreshing
/// it when needed.
pub async fn ensure_fresh(backend: &dyn Backend, session: &Session) -> Result<Session> {
    if !session.expires_within(REFRESH_WINDOW) {
        return Ok(session.clone());
    }
    tracing::debug!(user = %session.user_id(), "refreshing session");
    backend
        .refresh_session(&session.refresh_token)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "session refresh failed");
            ChatError::NotSignedIn
        })
}
