use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use url::Url;
use uuid::Uuid;

use super::{
    realtime, Backend, BackendError, ChangeFeed, ChangeFilter, Credential, OAuthProvider, Query,
    SignUp, UserChanges,
};
use crate::session::{AuthUser, Session};

/// Client for the hosted service's REST surfaces.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    anon_key: String,
    service_key: Option<String>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base", &self.base.as_str())
            .field("anon_key", &"<redacted>")
            .field("service_key", &self.service_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(|| {
                OffsetDateTime::now_utc() + Duration::seconds(self.expires_in.unwrap_or(3600))
            });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Build a [`BackendError`] from a non-success response. Table errors carry
/// `code`/`message`, auth errors `error_code`/`msg` or `error`/`error_description`.
async fn error_from(resp: Response) -> BackendError {
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    let pick = |keys: &[&str]| {
        keys.iter().find_map(|k| match body.get(*k) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    };
    let code = pick(&["code", "error_code", "error"]).unwrap_or_else(|| status.to_string());
    let message = pick(&["message", "msg", "error_description", "error"])
        .unwrap_or_else(|| format!("request failed with status {status}"));
    BackendError::new(status, code, message)
}

async fn expect_json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }
    resp.json().await.map_err(BackendError::decode)
}

async fn expect_ok(resp: Response) -> Result<(), BackendError> {
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }
    Ok(())
}

impl HttpBackend {
    pub fn new(base: Url, anon_key: String, service_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base,
            anon_key,
            service_key,
        }
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base.join(path).map_err(BackendError::decode)
    }

    fn service_key(&self) -> Result<&str, BackendError> {
        self.service_key
            .as_deref()
            .ok_or_else(|| BackendError::unauthorized("service role key not configured"))
    }

    fn bearer(&self, cred: Credential<'_>) -> Result<String, BackendError> {
        Ok(match cred {
            Credential::Anon => self.anon_key.clone(),
            Credential::User(session) => session.access_token.clone(),
            Credential::Token(token) => token.to_string(),
            Credential::Service => self.service_key()?.to_string(),
        })
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        cred: Credential<'_>,
    ) -> Result<RequestBuilder, BackendError> {
        let api_key = match cred {
            Credential::Service => self.service_key()?.to_string(),
            _ => self.anon_key.clone(),
        };
        Ok(self
            .client
            .request(method, url)
            .header("apikey", api_key)
            .bearer_auth(self.bearer(cred)?))
    }

    fn table_request(
        &self,
        method: Method,
        cred: Credential<'_>,
        query: &Query,
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.url(&format!("rest/v1/{}", query.table))?;
        let mut params = query.to_params();
        params.insert(0, ("select".into(), "*".into()));
        Ok(self
            .request(method, url, cred)?
            .header(header::ACCEPT, "application/json")
            .header("Prefer", "return=representation")
            .query(&params))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, BackendError> {
        builder.send().await.map_err(BackendError::transport)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, BackendError> {
        let req = self
            .request(Method::POST, self.url("auth/v1/signup")?, Credential::Anon)?
            .json(&json!({ "email": email, "password": password }));
        let body: Value = expect_json(Self::send(req).await?).await?;
        // with confirmation enabled the body is the bare user
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body).map_err(BackendError::decode)?;
            let session = token.into_session();
            Ok(SignUp {
                user: session.user.clone(),
                session: Some(session),
            })
        } else {
            let user = serde_json::from_value(body).map_err(BackendError::decode)?;
            Ok(SignUp {
                user,
                session: None,
            })
        }
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let mut url = self.url("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let req = self
            .request(Method::POST, url, Credential::Anon)?
            .json(&json!({ "email": email, "password": password }));
        let token: TokenResponse = expect_json(Self::send(req).await?).await?;
        Ok(token.into_session())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, BackendError> {
        let mut url = self.url("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let req = self
            .request(Method::POST, url, Credential::Anon)?
            .json(&json!({ "refresh_token": refresh_token }));
        let token: TokenResponse = expect_json(Self::send(req).await?).await?;
        Ok(token.into_session())
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        let req = self
            .client
            .get(self.url("auth/v1/user")?)
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token);
        expect_json(Self::send(req).await?).await
    }

    async fn update_user(
        &self,
        session: &Session,
        changes: &UserChanges,
    ) -> Result<AuthUser, BackendError> {
        let req = self
            .request(Method::PUT, self.url("auth/v1/user")?, Credential::User(session))?
            .json(changes);
        expect_json(Self::send(req).await?).await
    }

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut url = self.url("auth/v1/recover")?;
        if let Some(redirect) = redirect_to {
            url.query_pairs_mut().append_pair("redirect_to", redirect);
        }
        let req = self
            .request(Method::POST, url, Credential::Anon)?
            .json(&json!({ "email": email }));
        expect_ok(Self::send(req).await?).await
    }

    fn authorize_url(&self, provider: OAuthProvider, redirect_to: &str) -> Result<Url, BackendError> {
        let mut url = self.url("auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect_to);
        Ok(url)
    }

    async fn sign_out(&self, session: &Session) -> Result<(), BackendError> {
        let req = self.request(Method::POST, self.url("auth/v1/logout")?, Credential::User(session))?;
        expect_ok(Self::send(req).await?).await
    }

    async fn admin_delete_user(&self, user_id: Uuid) -> Result<(), BackendError> {
        let url = self.url(&format!("auth/v1/admin/users/{user_id}"))?;
        let req = self.request(Method::DELETE, url, Credential::Service)?;
        expect_ok(Self::send(req).await?).await
    }

    async fn select(&self, cred: Credential<'_>, query: &Query) -> Result<Vec<Value>, BackendError> {
        let req = self.table_request(Method::GET, cred, query)?;
        expect_json(Self::send(req).await?).await
    }

    async fn insert(
        &self,
        cred: Credential<'_>,
        table: &str,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, BackendError> {
        let req = self
            .table_request(Method::POST, cred, &Query::table(table))?
            .json(&rows);
        expect_json(Self::send(req).await?).await
    }

    async fn update(
        &self,
        cred: Credential<'_>,
        query: &Query,
        patch: Value,
    ) -> Result<Vec<Value>, BackendError> {
        let req = self.table_request(Method::PATCH, cred, query)?.json(&patch);
        expect_json(Self::send(req).await?).await
    }

    async fn delete(&self, cred: Credential<'_>, query: &Query) -> Result<Vec<Value>, BackendError> {
        let req = self.table_request(Method::DELETE, cred, query)?;
        expect_json(Self::send(req).await?).await
    }

    async fn upload(
        &self,
        cred: Credential<'_>,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), BackendError> {
        let url = self.url(&format!("storage/v1/object/{bucket}/{path}"))?;
        let req = self
            .request(Method::POST, url, cred)?
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(data);
        expect_ok(Self::send(req).await?).await
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}storage/v1/object/public/{bucket}/{path}",
            self.base.as_str()
        )
    }

    async fn subscribe(
        &self,
        cred: Credential<'_>,
        filter: ChangeFilter,
    ) -> Result<ChangeFeed, BackendError> {
        let socket = realtime::socket_url(&self.base, &self.anon_key)?;
        let token = self.bearer(cred)?;
        realtime::subscribe(socket, &token, filter).await
    }
}
