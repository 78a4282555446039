use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::error::MailError;
use crate::models;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<models::Error> for ApiError {
    fn from(err: models::Error) -> Self {
        ApiError::Mail(MailError::Storage(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response<axum::body::Body> {
        let (status, message) = match &self {
            ApiError::Mail(MailError::Validation(e)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            ApiError::Mail(MailError::Auth(e)) => (StatusCode::FORBIDDEN, e.to_string()),
            ApiError::Mail(MailError::Transient(e)) => {
                error!("API server transient error: {e}");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            ApiError::Mail(MailError::Storage(models::Error::NotFound(m))) => {
                (StatusCode::NOT_FOUND, m.to_string())
            }
            ApiError::Mail(MailError::Storage(models::Error::Conflict)) => {
                (StatusCode::CONFLICT, "conflict".to_owned())
            }
            other => {
                error!("API server error: {other} {other:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_owned(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
