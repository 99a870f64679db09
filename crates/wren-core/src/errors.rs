/// Core error type for the bot.
///
/// Adapter crates should map their specific errors into this type so the core
/// can handle failures consistently (fatal vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Login / session failures. Fatal at startup.
    #[error("auth error: {0}")]
    Auth(String),

    /// The backing store is unreachable or rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// Remote service call failed. Retryable up to the caller's attempt ceiling.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
