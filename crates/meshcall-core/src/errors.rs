use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("settings error: {0}")]
    Settings(String),
}
