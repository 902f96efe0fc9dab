// PackCam Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackCamError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event not found: {0}")]
    EventNotFound(i64),

    #[error("Camera not found: {0}")]
    CameraNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("FFprobe error: {0}")]
    FFprobe(String),

    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PackCamError {
    fn from(err: anyhow::Error) -> Self {
        PackCamError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PackCamError>;
