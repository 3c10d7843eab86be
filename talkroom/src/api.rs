use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use talkroom_api::{
    DeleteAccountRequest, DeleteAccountResponse, ErrorBody, JoinRequest, JoinResponse,
    PROFILES_TABLE,
};

use crate::backend::{Backend, Credential, Query};
use crate::config::Config;
use crate::error::ChatError;
use crate::rooms;
use crate::session::AuthUser;

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub config: Config,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>, config: Config) -> Self {
        Self { backend, config }
    }
}

/// Caller identity established by [`auth_middleware`].
#[derive(Clone, Debug)]
pub struct Caller {
    pub user: AuthUser,
    pub access_token: String,
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/chat/join", post(join_room))
        .route("/api/delete-account", post(delete_account))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, (StatusCode, Json<ErrorBody>)> {
    let token = bearer_token(&req).ok_or(err(StatusCode::UNAUTHORIZED, "authentication required"))?;
    match state.backend.get_user(&token).await {
        Ok(user) => {
            req.extensions_mut().insert(Caller {
                user,
                access_token: token,
            });
            Ok(next.run(req).await)
        }
        Err(e) if e.is_unauthorized() => Err(err(StatusCode::UNAUTHORIZED, "authentication required")),
        Err(e) => {
            tracing::error!(error = %e, "verifying caller failed");
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, "an error occurred"))
        }
    }
}

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: msg.into() }))
}

/// Unwrap a JSON body, answering malformed ones with the usual error object.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, (StatusCode, Json<ErrorBody>)> {
    payload.map(|Json(v)| v).map_err(|rejection| {
        tracing::debug!(error = %rejection, "rejected request body");
        err(StatusCode::BAD_REQUEST, "invalid request body")
    })
}

async fn join_room(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let req = body(payload)?;
    let joined = rooms::join_as(
        state.backend.as_ref(),
        Credential::Token(&caller.access_token),
        caller.user.id,
        &req.invite_code,
        state.config.chat.membership_limit,
    )
    .await;
    match joined {
        Ok(room_id) => Ok(Json(JoinResponse { room_id })),
        Err(ChatError::InvalidInviteCode) => Err(err(StatusCode::NOT_FOUND, "invalid invite code")),
        Err(ChatError::AlreadyMember(_)) => {
            Err(err(StatusCode::BAD_REQUEST, "already a member of this room"))
        }
        Err(ChatError::MembershipLimit(n)) => Err(err(
            StatusCode::CONFLICT,
            &format!("you can belong to at most {n} rooms"),
        )),
        Err(ChatError::Backend(e)) if e.is_unauthorized() => {
            Err(err(StatusCode::UNAUTHORIZED, "authentication required"))
        }
        Err(e) => {
            tracing::error!(error = %e, "join failed");
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, "an error occurred"))
        }
    }
}

async fn delete_account(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<DeleteAccountRequest>, JsonRejection>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let req = body(payload)?;
    let user_id = req
        .user_id
        .ok_or(err(StatusCode::BAD_REQUEST, "userId is required"))?;
    if user_id != caller.user.id {
        return Err(err(StatusCode::FORBIDDEN, "cannot delete another account"));
    }

    // the auth account is what matters; a stale profile row is tolerable
    let profile = Query::table(PROFILES_TABLE).eq("id", user_id);
    if let Err(e) = state.backend.delete(Credential::Service, &profile).await {
        tracing::warn!(user = %user_id, error = %e, "profile deletion failed");
    }
    if let Err(e) = state.backend.admin_delete_user(user_id).await {
        tracing::error!(user = %user_id, error = %e, "user deletion failed");
        return Err(err(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete user"));
    }
    tracing::info!(user = %user_id, "account deleted");
    Ok(Json(DeleteAccountResponse {
        success: true,
        message: "account deleted".into(),
    }))
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(backend: Arc<dyn Backend>, config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let state = AppState::new(backend, config);
    tracing::info!(%addr, "serving first-party endpoints");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// Integration tests live in tests/ directory
