use std::io;
use std::time::Duration;

/// All errors surfaced by the hub core.
///
/// Authentication failures are distinct variants (not folded into
/// [`Error::Transport`]) so callers can prompt for re-authentication
/// specifically.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Configuration import/export.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("unrecognized configuration format")]
    UnrecognizedFormat,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Connection lifecycle.
    #[error("connect already in progress for server {0}")]
    AlreadyConnecting(String),

    #[error("server {0} is already connected")]
    AlreadyConnected(String),

    #[error("server {0} is not connected")]
    NotConnected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport closed")]
    ChannelClosed,

    // Subprocess supervision.
    #[error("failed to spawn server process: {0}")]
    ProcessSpawnFailed(String),

    #[error("no running process for server {0}")]
    ProcessNotRunning(String),

    #[error("restart limit exceeded for server {0}")]
    RestartLimitExceeded(String),

    // OAuth.
    #[error("authentication required for server {0}")]
    AuthenticationRequired(String),

    #[error("OAuth callback state does not match any pending flow")]
    AuthStateMismatch,

    #[error("token exchange failed: {0}")]
    AuthExchangeFailed(String),

    // Registry.
    #[error("unknown server {0}")]
    ServerNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the caller should re-run the OAuth flow to recover.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationRequired(_)
                | Error::AuthStateMismatch
                | Error::AuthExchangeFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
