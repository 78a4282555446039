use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DocStatus, Error, MailRecipient, RecipientKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "incoming_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncomingStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "incoming_folder", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncomingFolder {
    Inbox,
    Spam,
}

/// SPF/DKIM/DMARC verdicts extracted from the Authentication-Results
/// headers the edge agent stamped on the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationResults {
    pub spf_pass: bool,
    pub spf_description: String,
    pub dkim_pass: bool,
    pub dkim_description: String,
    pub dmarc_pass: bool,
    pub dmarc_description: String,
}

/// One delivered (or rejected) inbound mail, bound to a single receiver
/// mailbox. Alias fan-out creates one row per destination.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct IncomingMail {
    pub id: Uuid,
    pub receiver: String,
    pub domain_name: String,
    pub sender: String,
    pub display_name: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_plain: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub message: String,
    pub message_size: i64,
    pub from_ip: Option<String>,
    pub from_host: Option<String>,
    pub agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// Seconds between the origin Date header and receipt at the edge.
    pub received_after: f64,
    pub processed_at: DateTime<Utc>,
    /// Seconds the core took to process after receipt.
    pub processed_after: f64,
    pub is_spam: bool,
    pub spam_score: f64,
    pub is_rejected: bool,
    pub rejection_message: Option<String>,
    pub folder: IncomingFolder,
    pub status: IncomingStatus,
    pub spf_pass: bool,
    pub spf_description: String,
    pub dkim_pass: bool,
    pub dkim_description: String,
    pub dmarc_pass: bool,
    pub dmarc_description: String,
    pub docstatus: DocStatus,
    #[sqlx(skip)]
    pub recipients: Vec<MailRecipient>,
}

#[derive(Clone)]
pub struct IncomingMailRepository {
    pool: PgPool,
}

impl IncomingMailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, mail: &IncomingMail) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO incoming_mails
                (id, receiver, domain_name, sender, display_name, subject, body_html, body_plain,
                 reply_to, message_id, in_reply_to, message, message_size, from_ip, from_host, agent,
                 created_at, received_at, received_after, processed_at, processed_after,
                 is_spam, spam_score, is_rejected, rejection_message, folder, status,
                 spf_pass, spf_description, dkim_pass, dkim_description, dmarc_pass, dmarc_description,
                 docstatus)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27,
                    $28, $29, $30, $31, $32, $33, $34)
            "#,
        )
        .bind(mail.id)
        .bind(&mail.receiver)
        .bind(&mail.domain_name)
        .bind(&mail.sender)
        .bind(&mail.display_name)
        .bind(&mail.subject)
        .bind(&mail.body_html)
        .bind(&mail.body_plain)
        .bind(&mail.reply_to)
        .bind(&mail.message_id)
        .bind(&mail.in_reply_to)
        .bind(&mail.message)
        .bind(mail.message_size)
        .bind(&mail.from_ip)
        .bind(&mail.from_host)
        .bind(&mail.agent)
        .bind(mail.created_at)
        .bind(mail.received_at)
        .bind(mail.received_after)
        .bind(mail.processed_at)
        .bind(mail.processed_after)
        .bind(mail.is_spam)
        .bind(mail.spam_score)
        .bind(mail.is_rejected)
        .bind(&mail.rejection_message)
        .bind(mail.folder)
        .bind(mail.status)
        .bind(mail.spf_pass)
        .bind(&mail.spf_description)
        .bind(mail.dkim_pass)
        .bind(&mail.dkim_description)
        .bind(mail.dmarc_pass)
        .bind(&mail.dmarc_description)
        .bind(mail.docstatus)
        .execute(&mut *tx)
        .await?;

        for recipient in &mail.recipients {
            sqlx::query(
                r#"
                INSERT INTO incoming_mail_recipients (mail_id, kind, email, display_name)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(mail.id)
            .bind(recipient.kind)
            .bind(&recipient.email)
            .bind(&recipient.display_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<IncomingMail, Error> {
        let mut mail =
            sqlx::query_as::<_, IncomingMail>("SELECT * FROM incoming_mails WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::NotFound("incoming mail not found"))?;
        mail.recipients = self.recipients_of(id).await?;
        Ok(mail)
    }

    pub async fn recipients_of(&self, id: Uuid) -> Result<Vec<MailRecipient>, Error> {
        Ok(sqlx::query_as::<_, MailRecipient>(
            r#"
            SELECT mail_id, kind, email, display_name,
                   'pending'::recipient_status AS status,
                   0 AS retries,
                   NULL::timestamptz AS action_at,
                   NULL::double precision AS action_after,
                   NULL::jsonb AS details
            FROM incoming_mail_recipients
            WHERE mail_id = $1
            ORDER BY email
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Recipients of a mail split into To and Cc lists for the summarised
    /// pull shape.
    pub async fn recipients_by_kind(
        &self,
        id: Uuid,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let recipients = self.recipients_of(id).await?;
        let mut to = Vec::new();
        let mut cc = Vec::new();
        for r in recipients {
            let formatted = crate::utils::format_addr(r.display_name.as_deref(), &r.email);
            match r.kind {
                RecipientKind::To => to.push(formatted),
                RecipientKind::Cc => cc.push(formatted),
                RecipientKind::Bcc => {}
            }
        }
        Ok((to, cc))
    }

    pub async fn purge_rejected(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        Ok(
            sqlx::query("DELETE FROM incoming_mails WHERE is_rejected AND processed_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }
}
