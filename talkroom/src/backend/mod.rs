//! Access to the hosted backend: auth, tables, object storage and realtime.
//!
//! Everything the application persists lives remotely. [`Backend`] is the
//! seam; [`HttpBackend`] talks to the hosted service and [`MemoryBackend`]
//! keeps the same semantics in process.

mod http;
mod memory;
mod realtime;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use talkroom_api::{ChangeEvent, ChangeKind};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;
use uuid::Uuid;

use crate::session::{AuthUser, Session};

/// Error reported by the hosted service, or by the transport reaching it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status {status}, code {code})")]
pub struct BackendError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &'static str = "23503";
    pub const NO_ROWS: &'static str = "PGRST116";

    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "unauthorized", message)
    }

    pub fn no_rows() -> Self {
        Self::new(406, Self::NO_ROWS, "JSON object requested, multiple (or no) rows returned")
    }

    pub fn transport(err: impl fmt::Display) -> Self {
        Self::new(0, "transport", err.to_string())
    }

    pub fn decode(err: impl fmt::Display) -> Self {
        Self::new(0, "decode", err.to_string())
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code == Self::UNIQUE_VIOLATION
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Self::NO_ROWS || self.status == 404
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

/// Row filter, expressed the way the REST layer spells it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    In(String, Vec<String>),
}

impl Filter {
    fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(col, expected) => row
                .get(col)
                .map(|v| render(v) == *expected)
                .unwrap_or(false),
            Filter::In(col, allowed) => row
                .get(col)
                .map(|v| allowed.contains(&render(v)))
                .unwrap_or(false),
        }
    }

    fn to_param(&self) -> (String, String) {
        match self {
            Filter::Eq(col, v) => (col.clone(), format!("eq.{v}")),
            Filter::In(col, vs) => (col.clone(), format!("in.({})", vs.join(","))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A table query: filters, ordering and an optional row limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters
            .push(Filter::Eq(column.to_string(), value.to_string()));
        self
    }

    pub fn in_list<I, T>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a row satisfies every filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Query-string parameters for the REST endpoint.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> =
            self.filters.iter().map(Filter::to_param).collect();
        if let Some(order) = &self.order {
            let dir = if order.ascending { "asc" } else { "desc" };
            params.push(("order".into(), format!("{}.{}", order.column, dir)));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params
    }

    /// Filter, sort and truncate a set of rows the way the remote side would.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut out: Vec<Value> = rows.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(order) = &self.order {
            out.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Text form of a column value as it appears in a filter.
fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}

/// Orders column values: timestamps chronologically, numbers numerically,
/// anything else by text. Missing values sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            let (sa, sb) = (render(a), render(b));
            match (
                OffsetDateTime::parse(&sa, &Rfc3339),
                OffsetDateTime::parse(&sb, &Rfc3339),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => sa.cmp(&sb),
            }
        }
    }
}

/// Who a table/storage call is made as.
#[derive(Clone, Copy)]
pub enum Credential<'a> {
    Anon,
    User(&'a Session),
    /// Bare access token presented by a caller of the first-party endpoints.
    Token(&'a str),
    /// Privileged server-side key; bypasses row level security.
    Service,
}

impl<'a> From<&'a Session> for Credential<'a> {
    fn from(session: &'a Session) -> Self {
        Credential::User(session)
    }
}

/// Outcome of a sign-up. Without a session the account still awaits email
/// confirmation.
#[derive(Debug, Clone)]
pub struct SignUp {
    pub user: AuthUser,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UserChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Github,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Github => "github",
        }
    }
}

impl std::str::FromStr for OAuthProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            other => Err(format!("unsupported provider: {other}")),
        }
    }
}

/// Which row changes a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: String,
    /// `None` means every kind of change.
    pub kind: Option<ChangeKind>,
    pub eq: Option<(String, String)>,
}

impl ChangeFilter {
    pub fn inserts(table: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: Some(ChangeKind::Insert),
            eq: None,
        }
    }

    pub fn all(table: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: None,
            eq: None,
        }
    }

    pub fn where_eq(mut self, column: &str, value: impl ToString) -> Self {
        self.eq = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        match &self.eq {
            None => true,
            Some((col, value)) => event
                .record
                .as_ref()
                .or(event.old_record.as_ref())
                .and_then(|r| r.get(col))
                .map(|v| render(v) == *value)
                .unwrap_or(false),
        }
    }

    /// Filter expression in the realtime service's syntax.
    pub fn expression(&self) -> Option<String> {
        self.eq.as_ref().map(|(c, v)| format!("{c}=eq.{v}"))
    }
}

/// Stream of row changes. Dropping it ends the subscription.
pub struct ChangeFeed {
    rx: mpsc::Receiver<ChangeEvent>,
    _guard: DropGuard,
}

impl ChangeFeed {
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, BackendError>;
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError>;
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, BackendError>;
    async fn get_user(&self, access_token: &str) -> Result<AuthUser, BackendError>;
    async fn update_user(
        &self,
        session: &Session,
        changes: &UserChanges,
    ) -> Result<AuthUser, BackendError>;
    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> Result<(), BackendError>;
    fn authorize_url(&self, provider: OAuthProvider, redirect_to: &str) -> Result<Url, BackendError>;
    async fn sign_out(&self, session: &Session) -> Result<(), BackendError>;
    async fn admin_delete_user(&self, user_id: Uuid) -> Result<(), BackendError>;

    async fn select(&self, cred: Credential<'_>, query: &Query) -> Result<Vec<Value>, BackendError>;
    async fn insert(
        &self,
        cred: Credential<'_>,
        table: &str,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, BackendError>;
    async fn update(
        &self,
        cred: Credential<'_>,
        query: &Query,
        patch: Value,
    ) -> Result<Vec<Value>, BackendError>;
    async fn delete(&self, cred: Credential<'_>, query: &Query) -> Result<Vec<Value>, BackendError>;

    async fn upload(
        &self,
        cred: Credential<'_>,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), BackendError>;
    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn subscribe(
        &self,
        cred: Credential<'_>,
        filter: ChangeFilter,
    ) -> Result<ChangeFeed, BackendError>;
}

/// Select rows and deserialize them.
pub async fn select_rows<T: DeserializeOwned>(
    backend: &dyn Backend,
    cred: Credential<'_>,
    query: &Query,
) -> Result<Vec<T>, BackendError> {
    backend
        .select(cred, query)
        .await?
        .into_iter()
        .map(|row| serde_json::from_value(row).map_err(BackendError::decode))
        .collect()
}

/// Select exactly one row; zero or several rows is a `PGRST116` error.
pub async fn select_single<T: DeserializeOwned>(
    backend: &dyn Backend,
    cred: Credential<'_>,
    query: &Query,
) -> Result<T, BackendError> {
    let mut rows = backend.select(cred, query).await?;
    if rows.len() != 1 {
        return Err(BackendError::no_rows());
    }
    serde_json::from_value(rows.remove(0)).map_err(BackendError::decode)
}

/// Select at most one row.
pub async fn select_optional<T: DeserializeOwned>(
    backend: &dyn Backend,
    cred: Credential<'_>,
    query: &Query,
) -> Result<Option<T>, BackendError> {
    match select_single(backend, cred, query).await {
        Ok(row) => Ok(Some(row)),
        Err(e) if e.code == BackendError::NO_ROWS => Ok(None),
        Err(e) => Err(e),
    }
}

/// Insert one row and return its stored representation.
pub async fn insert_row<T: Serialize, R: DeserializeOwned>(
    backend: &dyn Backend,
    cred: Credential<'_>,
    table: &str,
    row: &T,
) -> Result<R, BackendError> {
    let value = serde_json::to_value(row).map_err(BackendError::decode)?;
    let mut stored = backend.insert(cred, table, vec![value]).await?;
    if stored.is_empty() {
        return Err(BackendError::no_rows());
    }
    serde_json::from_value(stored.remove(0)).map_err(BackendError::decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_params_follow_rest_syntax() {
        let q = Query::table("messages")
            .eq("room_id", "abc")
            .in_list("user_id", ["u1", "u2"])
            .order("created_at", false)
            .limit(30);
        assert_eq!(
            q.to_params(),
            vec![
                ("room_id".to_string(), "eq.abc".to_string()),
                ("user_id".to_string(), "in.(u1,u2)".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "30".to_string()),
            ]
        );
    }

    #[test]
    fn apply_orders_timestamps_chronologically() {
        let rows = vec![
            json!({"id": "b", "created_at": "2024-05-01T10:00:00.1Z"}),
            json!({"id": "a", "created_at": "2024-05-01T10:00:00Z"}),
            json!({"id": "c", "created_at": "2024-05-01T09:59:59.999Z"}),
        ];
        let out = Query::table("t").order("created_at", true).apply(rows);
        let ids: Vec<_> = out.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn filters_compare_rendered_values() {
        let row = json!({"n": 5, "flag": true, "s": "x"});
        assert!(Query::table("t").eq("n", 5).eq("flag", true).matches(&row));
        assert!(Query::table("t").in_list("s", ["y", "x"]).matches(&row));
        assert!(!Query::table("t").eq("missing", "x").matches(&row));
    }

    #[test]
    fn change_filter_checks_table_kind_and_column() {
        let filter = ChangeFilter::inserts("messages").where_eq("room_id", "r1");
        let ev = ChangeEvent {
            table: "messages".into(),
            kind: ChangeKind::Insert,
            record: Some(json!({"room_id": "r1"})),
            old_record: None,
        };
        assert!(filter.matches(&ev));
        let other_room = ChangeEvent {
            record: Some(json!({"room_id": "r2"})),
            ..ev.clone()
        };
        assert!(!filter.matches(&other_room));
        let update = ChangeEvent {
            kind: ChangeKind::Update,
            ..ev
        };
        assert!(!filter.matches(&update));
        assert_eq!(filter.expression().as_deref(), Some("room_id=eq.r1"));
    }

    #[test]
    fn error_classification() {
        assert!(BackendError::new(409, "23505", "dup").is_unique_violation());
        assert!(BackendError::no_rows().is_not_found());
        assert!(BackendError::unauthorized("no").is_unauthorized());
    }
}
