use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::api::ApiResult;
use crate::spam::{MailDirection, SpamChecker};

#[derive(Deserialize)]
pub struct ScanRequest {
    message: String,
}

#[derive(Deserialize)]
pub struct IsSpamRequest {
    message: String,
    #[serde(default)]
    email_type: EmailType,
}

#[derive(Deserialize, Default, Clone, Copy)]
pub enum EmailType {
    Inbound,
    #[default]
    Outbound,
}

impl From<EmailType> for MailDirection {
    fn from(value: EmailType) -> Self {
        match value {
            EmailType::Inbound => MailDirection::Inbound,
            EmailType::Outbound => MailDirection::Outbound,
        }
    }
}

#[derive(Serialize)]
pub struct ScanResponse {
    spam_score: f64,
    spam_headers: Vec<(String, String)>,
}

pub async fn scan(
    State(spam): State<SpamChecker>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<ScanResponse> {
    let outcome = spam.scan(&request.message).await?;
    Ok(Json(ScanResponse {
        spam_score: outcome.score,
        spam_headers: outcome.headers,
    }))
}

pub async fn is_spam(
    State(spam): State<SpamChecker>,
    Json(request): Json<IsSpamRequest>,
) -> ApiResult<bool> {
    let verdict = spam
        .is_spam(&request.message, request.email_type.into())
        .await?;
    Ok(Json(verdict))
}

pub async fn score(
    State(spam): State<SpamChecker>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<f64> {
    Ok(Json(spam.score(&request.message).await?))
}
