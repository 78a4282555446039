use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use crate::api::{request_context, ApiResult};
use crate::sync::{PullRawResult, PullResult, SyncService};

#[derive(Deserialize)]
pub struct PullQuery {
    mailbox: String,
    #[serde(default = "default_limit")]
    limit: i64,
    last_synced_at: Option<String>,
}

fn default_limit() -> i64 {
    50
}

pub async fn pull(
    State(sync): State<SyncService>,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> ApiResult<PullResult> {
    let ctx = request_context(&headers);
    let result = sync
        .pull(
            &ctx,
            &query.mailbox,
            query.limit,
            query.last_synced_at.as_deref(),
        )
        .await?;
    Ok(Json(result))
}

pub async fn pull_raw(
    State(sync): State<SyncService>,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> ApiResult<PullRawResult> {
    let ctx = request_context(&headers);
    let result = sync
        .pull_raw(
            &ctx,
            &query.mailbox,
            query.limit,
            query.last_synced_at.as_deref(),
        )
        .await?;
    Ok(Json(result))
}
