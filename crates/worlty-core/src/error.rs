use thiserror::Error;
use worlty_rpc::AuthError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Authentication failed ({reason}): {0}", reason = .0.reason())]
    Auth(#[from] AuthError),

    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Stable setup failure reason, for errors that came out of the handshake
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Auth(e) => Some(e.reason()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
