use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::api::ApiError;
use crate::models::OutgoingMailRepository;

/// 1x1 transparent PNG served for every open-tracking hit.
const PIXEL: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Deserialize)]
pub struct OpenQuery {
    id: Option<String>,
}

/// Record a mail-open event: first/last opened timestamps and the open
/// counter move in one statement, then the pixel is returned. Unknown or
/// missing ids still get the pixel.
pub async fn open(
    State(repository): State<OutgoingMailRepository>,
    Query(query): Query<OpenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(id) = query.id.filter(|id| !id.is_empty()) {
        repository.record_open(&id).await?;
    }

    Ok(([(header::CONTENT_TYPE, "image/png")], PIXEL))
}
