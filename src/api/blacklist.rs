use axum::extract::{Query, State};
use serde::Deserialize;

use crate::api::{ApiResult, ApiError};
use crate::models::{BlacklistRepository, IpBlacklistEntry};

#[derive(Deserialize)]
pub struct BlacklistQuery {
    ip_address: String,
}

/// Group-scoped blocklist lookup; unknown addresses get a lazily created
/// non-blacklisted entry.
pub async fn lookup(
    State(repository): State<BlacklistRepository>,
    Query(query): Query<BlacklistQuery>,
) -> ApiResult<IpBlacklistEntry> {
    let entry = repository
        .lookup_or_create(&query.ip_address)
        .await
        .map_err(ApiError::from)?;
    Ok(axum::Json(entry))
}
