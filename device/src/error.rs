use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("access key is not valid base64: {0}")]
    KeyDecode(#[from] base64::DecodeError),
    #[error("hmac key rejected")]
    InvalidKey,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("device is not activated")]
    NotActivated,
    #[error("device secret key is missing, re-activate the device")]
    MissingSecret,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP status: {0}")]
    Status(u16),
    #[error("unparseable response: {0}")]
    Decode(String),
    #[error("API error: {msg}")]
    Rejected { code: String, msg: String },
    #[error("authentication failed")]
    AuthDenied,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("wifi not connected")]
    NotConnected,
    #[error("token generation failed: {0}")]
    Token(#[from] TokenError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("activation server operation already in progress")]
    OperationInProgress,
    #[error("activation server already running")]
    AlreadyRunning,
    #[error("wifi not connected")]
    NotConnected,
    #[error("access point error: {0}")]
    AccessPoint(String),
    #[error("failed to bind activation server: {0}")]
    Bind(#[from] std::io::Error),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("activation aborted before completion")]
    Aborted,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("file already uploaded")]
    AlreadyUploaded,
    #[error("upload queue full")]
    QueueFull,
    #[error("no such upload task: {0}")]
    TaskNotFound(u32),
    #[error("cannot stat {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File too large (max 20MB)")]
    TooLarge { size: u64 },
    #[error("File open failed")]
    OpenFailed(#[source] std::io::Error),
    #[error("File read failed")]
    ReadFailed,
    #[error("Memory allocation failed")]
    AllocFailed,
    #[error("User token generation failed")]
    TokenFailed(#[source] TokenError),
    #[error("{msg}")]
    HttpFailed { status: Option<u16>, msg: String },
}

impl UploadError {
    pub(crate) fn http(status: Option<u16>, msg: impl Into<String>) -> Self {
        UploadError::HttpFailed {
            status,
            msg: msg.into(),
        }
    }
}
