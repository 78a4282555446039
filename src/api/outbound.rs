use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{request_context, ApiResult};
use crate::compose::{Composer, Submission};
use crate::models::OutgoingStatus;
use crate::outbound::TransferWorker;

#[derive(Serialize)]
pub struct SubmitResponse {
    id: Uuid,
    message_id: String,
    status: OutgoingStatus,
}

/// Accept a submission, compose and persist it, and push it straight to
/// the broker when it qualifies for the immediate path.
pub async fn submit(
    State(composer): State<Arc<Composer>>,
    State(transfer): State<Arc<TransferWorker>>,
    headers: HeaderMap,
    Json(mut submission): Json<Submission>,
) -> ApiResult<SubmitResponse> {
    let ctx = request_context(&headers);
    submission.via_api = true;

    let mail = composer.submit(&ctx, submission).await?;

    // a broker hiccup is already recorded on the mail; the submission
    // itself succeeded
    let _ = transfer.transfer_now(&mail).await;

    Ok(Json(SubmitResponse {
        id: mail.id,
        message_id: mail.message_id.clone(),
        status: mail.status,
    }))
}
