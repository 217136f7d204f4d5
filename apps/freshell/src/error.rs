use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("auth token is empty; set AUTH_TOKEN or pass --token")]
    EmptyAuthToken,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed before the server sent ready")]
    ClosedBeforeReady,
    #[error("server rejected hello: {0}")]
    HelloRejected(String),
    #[error("connection task is gone")]
    Disconnected,
}
