use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("not signed in")]
    NotSignedIn,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    #[error("invalid invite code")]
    InvalidInviteCode,

    #[error("already a member of room {0}")]
    AlreadyMember(Uuid),

    #[error("membership limit of {0} rooms reached")]
    MembershipLimit(usize),

    #[error("not a member of this room")]
    NotAMember,

    #[error("too many requests, try again shortly")]
    RateLimited,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the failure originated in the user's input rather than remotely.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidInviteCode
                | Self::AlreadyMember(_)
                | Self::MembershipLimit(_)
                | Self::NotAMember
        )
    }
}
