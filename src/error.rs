use thiserror::Error;

#[derive(Debug, Error)]
pub enum EaselError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no image data in provider response")]
    NoImageData,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

pub type Result<T> = std::result::Result<T, EaselError>;

/// Coarse classification used to decide retry behavior and to let callers
/// branch on failure families without string-matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    RequestShape,
    RateLimit,
    Server,
    NotFound,
    Network,
    NoImageData,
    Validation,
    Other,
}

impl EaselError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api { status, .. } => match status.as_u16() {
                401 | 403 => ErrorKind::Authentication,
                400 => ErrorKind::RequestShape,
                404 => ErrorKind::NotFound,
                408 => ErrorKind::Network,
                429 => ErrorKind::RateLimit,
                code if code >= 500 => ErrorKind::Server,
                _ => ErrorKind::Other,
            },
            Self::Http(err) => {
                if err.is_timeout() || err.is_connect() || err.status().is_none() {
                    ErrorKind::Network
                } else {
                    ErrorKind::Other
                }
            }
            Self::NoImageData => ErrorKind::NoImageData,
            Self::Validation(_) | Self::UnknownProvider(_) => ErrorKind::Validation,
            Self::Json(_) | Self::InvalidResponse(_) => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimit | ErrorKind::Server | ErrorKind::Network
        )
    }
}
