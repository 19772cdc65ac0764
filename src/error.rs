use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{format::QualityError, yt_dlp::ExtractError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Quality(#[from] QualityError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("host cpu usage at {0:.0}%")]
    Busy(f32),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Quality(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Extract(ExtractError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Extract(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }

        let body = match &self {
            AppError::Busy(_) => json!({ "status": "blocked", "reason": "high_cpu" }),
            AppError::Extract(ExtractError::NonZeroExit { stderr, .. }) => json!({
                "status": "error",
                "reason": self.to_string(),
                "stderr": stderr,
            }),
            _ => json!({ "status": "error", "reason": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
