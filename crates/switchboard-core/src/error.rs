use thiserror::Error;

/// Errors produced by the switchboard protocol and gateway layers.
#[derive(Debug, Error)]
pub enum SbError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SbError {
    /// Stable machine-readable code sent to clients in `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            SbError::Codec(_) | SbError::InvalidEvent(_) => "BAD_REQUEST",
            SbError::AuthFailed(_) | SbError::Token(_) => "UNAUTHORIZED",
            SbError::Forbidden(_) => "FORBIDDEN",
            SbError::NotFound(_) => "NOT_FOUND",
            SbError::Store(_) => "STORE_UNAVAILABLE",
            _ => "INTERNAL",
        }
    }
}

impl From<serde_json::Error> for SbError {
    fn from(e: serde_json::Error) -> Self {
        SbError::Codec(e.to_string())
    }
}

pub type SbResult<T> = Result<T, SbError>;
