use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Namespace '{namespace}' refused the connection: {message}")]
    ConnectRefused {
        namespace: String,
        message: String,
    },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Response envelope for {0} carried no data")]
    MissingData(String),

    #[error("A reply is still streaming; wait for it to finish")]
    TurnInFlight,

    #[error("Chat state has been shut down")]
    Disposed,

    #[error("Failed to encode attachment: {0}")]
    Encode(String),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
