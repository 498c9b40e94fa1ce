use thiserror::Error;

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("state store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("invalid container name: {0:?}")]
    InvalidContainer(String),

    #[error("file watch error: {0}")]
    Watch(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for HiveError {
    fn from(err: redis::RedisError) -> Self {
        HiveError::Store(err.to_string())
    }
}

impl From<notify::Error> for HiveError {
    fn from(err: notify::Error) -> Self {
        HiveError::Watch(err.to_string())
    }
}

impl HiveError {
    /// HTTP status and sanitized message for the web layer.
    pub fn status_code(&self) -> (u16, String) {
        match self {
            HiveError::Store(_) => (502, self.to_string()),
            HiveError::NotFound(_) => (404, self.to_string()),
            HiveError::InvalidContainer(_) => (400, self.to_string()),
            HiveError::Json(_) => (400, self.to_string()),
            HiveError::Pty(_) | HiveError::Watch(_) => (500, self.to_string()),
            HiveError::Io(_) => (500, "internal I/O error".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
