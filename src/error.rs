use thiserror::Error;

/// Errors surfaced by the synchronization core.
///
/// Cloneable so a terminal stream error can be handed to every subscriber
/// of the same feed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("not authenticated: sign in with Facebook or GitHub first")]
    NotAuthenticated,

    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("cannot compute progress: total lessons is {0}, must be positive")]
    Division(i32),

    #[error("course not found: {0}")]
    CourseNotFound(String),

    #[error("identity provider error: {0}")]
    Identity(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::RemoteUnavailable(e.to_string())
    }
}

/// A 4xx from the auth service means the credential itself was refused.
impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() => {
                tracing::debug!(%status, error = %e, "credential refused by auth service");
                SyncError::NotAuthenticated
            }
            _ => SyncError::Identity(e.to_string()),
        }
    }
}
