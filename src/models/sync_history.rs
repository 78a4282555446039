use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Error;

/// Resumable pull cursor, unique per `(source, user, mailbox)`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MailSyncHistory {
    pub id: i64,
    pub source: String,
    pub user: String,
    pub mailbox: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_synced_mail: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SyncHistoryRepository {
    pool: PgPool,
}

impl SyncHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The cursor for the triple, lazily created on first pull. The unique
    /// index makes concurrent first pulls converge on one row.
    pub async fn get_or_create(
        &self,
        source: &str,
        user: &str,
        mailbox: &str,
    ) -> Result<MailSyncHistory, Error> {
        if let Some(history) = sqlx::query_as::<_, MailSyncHistory>(
            r#"SELECT * FROM mail_sync_histories WHERE source = $1 AND "user" = $2 AND mailbox = $3"#,
        )
        .bind(source)
        .bind(user)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(history);
        }

        Ok(sqlx::query_as::<_, MailSyncHistory>(
            r#"
            INSERT INTO mail_sync_histories (source, "user", mailbox)
            VALUES ($1, $2, $3)
            ON CONFLICT (source, "user", mailbox) DO UPDATE SET mailbox = EXCLUDED.mailbox
            RETURNING *
            "#,
        )
        .bind(source)
        .bind(user)
        .bind(mailbox)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn advance(
        &self,
        id: i64,
        last_synced_at: DateTime<Utc>,
        last_synced_mail: Option<Uuid>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE mail_sync_histories
            SET last_synced_at = $2,
                last_synced_mail = COALESCE($3, last_synced_mail)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_synced_at)
        .bind(last_synced_mail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
