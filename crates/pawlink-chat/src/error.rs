use reqwest::StatusCode;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API rejected our credentials. Stored credentials have already been
    /// cleared by the time this is returned.
    #[error("session expired, please log in again")]
    Unauthorized,

    #[error("{context} returned unexpected status {status}")]
    Status {
        context: &'static str,
        status: StatusCode,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection is shut down")]
    Closed,

    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid config value for {key}: {value:?}")]
    Config { key: &'static str, value: String },

    #[error("message body is empty")]
    EmptyMessage,

    #[error("token store error: {0}")]
    TokenStore(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
