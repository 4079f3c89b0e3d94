use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("buffer not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage busy: {0}")]
    Busy(String),

    #[error("connection pool: {0}")]
    Pool(String),

    #[error("database unreadable: {0}")]
    Corruption(String),

    #[error("save failed: {0}")]
    SaveFailed(String),

    #[error("no active buffer")]
    NoActiveBuffer,

    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<r2d2::Error> for FlashError {
    fn from(e: r2d2::Error) -> Self {
        Self::Pool(e.to_string())
    }
}

impl FlashError {
    /// Transient storage conditions: a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Busy(_) | Self::Pool(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::NoActiveBuffer => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Busy(_) | Self::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SaveFailed(_) => StatusCode::CONFLICT,
            Self::Corruption(_) | Self::SessionClosed | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl axum::response::IntoResponse for FlashError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        }));
        (status, body).into_response()
    }
}
