use thiserror::Error;

/// Failures surfaced by chat operations.
///
/// Every variant except the internal ones maps to a user-facing failure
/// message; none of them are retried.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("you are not a member")]
    NotAMember,
    #[error("you are not the owner")]
    NotOwner,
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    #[error("cannot delete the default channel")]
    CannotDeleteDefaultChannel,
    #[error("invite is expired or used up")]
    InviteExpired,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Stable machine readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthorized => "unauthorized",
            ChatError::NotFound(_) => "not_found",
            ChatError::NotAMember => "not_a_member",
            ChatError::NotOwner => "not_owner",
            ChatError::AlreadyExists(_) => "already_exists",
            ChatError::CannotDeleteDefaultChannel => "cannot_delete_default_channel",
            ChatError::InviteExpired => "invite_expired",
            ChatError::InvalidInput(_) => "invalid_input",
            ChatError::Storage(_) | ChatError::Pool(_) | ChatError::Io(_) | ChatError::Json(_) => {
                "internal"
            }
        }
    }

    /// True for failures caused by the backend rather than the caller.
    pub fn is_internal(&self) -> bool {
        self.code() == "internal"
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

/// Map a unique-constraint violation to `AlreadyExists`, passing other errors through.
pub(crate) fn on_conflict(err: rusqlite::Error, what: &'static str) -> ChatError {
    if matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    ) {
        ChatError::AlreadyExists(what)
    } else {
        ChatError::Storage(err)
    }
}
