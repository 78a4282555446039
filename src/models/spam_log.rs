use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::models::Error;

/// Immutable record of one SpamAssassin scan.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SpamCheckLog {
    pub id: i64,
    pub message: String,
    pub source_ip_address: Option<String>,
    pub source_host: Option<String>,
    pub scanning_mode: String,
    pub hybrid_scanning_threshold: Option<f64>,
    pub spam_score: f64,
    pub spam_headers: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewSpamCheckLog {
    pub message: String,
    pub source_ip_address: Option<String>,
    pub source_host: Option<String>,
    pub scanning_mode: String,
    pub hybrid_scanning_threshold: Option<f64>,
    pub spam_score: f64,
    pub spam_headers: serde_json::Value,
}

#[derive(Clone)]
pub struct SpamCheckLogRepository {
    pool: PgPool,
}

impl SpamCheckLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, log: &NewSpamCheckLog) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO spam_check_logs
                (message, source_ip_address, source_host, scanning_mode,
                 hybrid_scanning_threshold, spam_score, spam_headers)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&log.message)
        .bind(&log.source_ip_address)
        .bind(&log.source_host)
        .bind(&log.scanning_mode)
        .bind(log.hybrid_scanning_threshold)
        .bind(log.spam_score)
        .bind(&log.spam_headers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        Ok(sqlx::query("DELETE FROM spam_check_logs WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }
}
