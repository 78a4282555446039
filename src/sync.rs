use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::config::MailSettings;
use crate::context::Context;
use crate::error::{MailError, ValidationError};
use crate::models::{
    IncomingFolder, IncomingMailRepository, MailboxRepository, SyncHistoryRepository,
};
use crate::utils::format_addr;

/// Summarised form of one pulled mail. Timestamps are UTC.
#[derive(Debug, Clone, Serialize)]
pub struct SyncMail {
    pub id: Uuid,
    pub folder: IncomingFolder,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PullResult {
    pub mails: Vec<SyncMail>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PullRawResult {
    pub mails: Vec<String>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SyncRow {
    id: Uuid,
    folder: IncomingFolder,
    display_name: Option<String>,
    sender: String,
    subject: String,
    body_html: Option<String>,
    body_plain: Option<String>,
    reply_to: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SyncRawRow {
    id: Uuid,
    message: String,
    processed_at: DateTime<Utc>,
}

/// Resumable per-(source, user, mailbox) pulls over processed incoming
/// mail, ordered by `processed_at`.
#[derive(Clone)]
pub struct SyncService {
    pool: PgPool,
    mailboxes: MailboxRepository,
    incoming: IncomingMailRepository,
    histories: SyncHistoryRepository,
    settings: MailSettings,
}

impl SyncService {
    pub fn new(pool: PgPool, settings: MailSettings) -> Self {
        Self {
            mailboxes: MailboxRepository::new(pool.clone()),
            incoming: IncomingMailRepository::new(pool.clone()),
            histories: SyncHistoryRepository::new(pool.clone()),
            pool,
            settings,
        }
    }

    async fn prepare(
        &self,
        ctx: &Context,
        mailbox: &str,
        limit: i64,
        last_synced_at: Option<&str>,
    ) -> Result<(i64, crate::models::MailSyncHistory, Option<DateTime<Utc>>), MailError> {
        let mailbox_record = self
            .mailboxes
            .get(mailbox)
            .await?
            .ok_or_else(|| ValidationError::InvalidEmail(mailbox.to_owned()))?;
        ctx.require_mailbox_owner(&mailbox_record)?;
        mailbox_record.check_incoming()?;

        if limit > self.settings.max_sync_via_api {
            return Err(ValidationError::SyncLimitExceeded(self.settings.max_sync_via_api).into());
        }
        let limit = limit.max(0);

        let requested_cursor = match last_synced_at {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| ValidationError::InvalidDateFormat(raw.to_owned()))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let history = self
            .histories
            .get_or_create(ctx.source(), &ctx.user, mailbox)
            .await?;
        let cursor = requested_cursor.or(history.last_synced_at);

        Ok((limit, history, cursor))
    }

    /// Mails for a mailbox strictly after the cursor, in summarised form.
    /// Persists the advanced cursor before returning.
    pub async fn pull(
        &self,
        ctx: &Context,
        mailbox: &str,
        limit: i64,
        last_synced_at: Option<&str>,
    ) -> Result<PullResult, MailError> {
        let (limit, history, cursor) = self.prepare(ctx, mailbox, limit, last_synced_at).await?;

        let rows = sqlx::query_as::<_, SyncRow>(
            r#"
            SELECT id, folder, display_name, sender, subject, body_html, body_plain,
                   reply_to, created_at, processed_at
            FROM incoming_mails
            WHERE docstatus = 1
              AND receiver = $1
              AND ($2::timestamptz IS NULL OR processed_at > $2)
            ORDER BY processed_at
            LIMIT $3
            "#,
        )
        .bind(mailbox)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let new_cursor = rows.last().map(|r| r.processed_at).unwrap_or_else(Utc::now);
        let last_mail = rows.last().map(|r| r.id);

        let mut mails = Vec::with_capacity(rows.len());
        for row in rows {
            let (to, cc) = self.incoming.recipients_by_kind(row.id).await?;
            mails.push(SyncMail {
                id: row.id,
                folder: row.folder,
                from: format_addr(row.display_name.as_deref(), &row.sender),
                to,
                cc,
                subject: row.subject,
                html: row.body_html,
                text: row.body_plain,
                reply_to: row.reply_to,
                created_at: row.created_at,
            });
        }

        self.histories
            .advance(history.id, new_cursor, last_mail)
            .await?;
        debug!(
            mailbox,
            source = ctx.source(),
            count = mails.len(),
            "pull advanced cursor"
        );

        Ok(PullResult {
            mails,
            last_synced_at: new_cursor,
        })
    }

    /// Same cursor progression, raw RFC 5322 payloads.
    pub async fn pull_raw(
        &self,
        ctx: &Context,
        mailbox: &str,
        limit: i64,
        last_synced_at: Option<&str>,
    ) -> Result<PullRawResult, MailError> {
        let (limit, history, cursor) = self.prepare(ctx, mailbox, limit, last_synced_at).await?;

        let rows = sqlx::query_as::<_, SyncRawRow>(
            r#"
            SELECT id, message, processed_at
            FROM incoming_mails
            WHERE docstatus = 1
              AND receiver = $1
              AND ($2::timestamptz IS NULL OR processed_at > $2)
            ORDER BY processed_at
            LIMIT $3
            "#,
        )
        .bind(mailbox)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let new_cursor = rows.last().map(|r| r.processed_at).unwrap_or_else(Utc::now);
        let last_mail = rows.last().map(|r| r.id);

        self.histories
            .advance(history.id, new_cursor, last_mail)
            .await?;

        Ok(PullRawResult {
            mails: rows.into_iter().map(|r| r.message).collect(),
            last_synced_at: new_cursor,
        })
    }
}
