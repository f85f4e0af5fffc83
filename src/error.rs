// Error types shared by the realtime and REST halves of the client

use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("realtime connection is not established")]
    NotConnected,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("a message is already being sent")]
    SendInProgress,

    #[error("no conversation is open")]
    NoActiveConversation,

    #[error("unknown message {0}")]
    UnknownMessage(String),

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("acknowledgment for {0} was dropped")]
    AckDropped(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("packet codec error: {0}")]
    Codec(String),

    #[error("request unauthorized after token refresh")]
    Unauthorized,

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("http transport error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}
