use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{DocStatus, Error, MailKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outgoing_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutgoingStatus {
    Pending,
    Transferring,
    Transferred,
    Queued,
    Sent,
    PartiallySent,
    Deferred,
    Bounced,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "recipient_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Deferred,
    Bounced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "recipient_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "To",
            RecipientKind::Cc => "Cc",
            RecipientKind::Bcc => "Bcc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outgoing_folder", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutgoingFolder {
    Drafts,
    Sent,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MailRecipient {
    pub mail_id: Uuid,
    pub kind: RecipientKind,
    pub email: String,
    pub display_name: Option<String>,
    pub status: RecipientStatus,
    pub retries: i32,
    pub action_at: Option<DateTime<Utc>>,
    /// Seconds between `action_at` and the mail's `transferred_at`.
    pub action_after: Option<f64>,
    /// Raw per-recipient detail blob reported by the delivering agent.
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct CustomHeader {
    pub key: String,
    pub value: String,
}

/// Reference to a stored attachment file; the bytes live in the document
/// store, never in the row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AttachmentRef {
    pub id: Uuid,
    pub mail_kind: MailKind,
    pub mail_id: Uuid,
    pub file_name: String,
    pub file_url: String,
    pub content_type: String,
    pub size: i64,
    pub inline: bool,
}

/// An outbound mail aggregate. `message` holds the full signed RFC 5322
/// text that goes over the wire.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OutgoingMail {
    pub id: Uuid,
    pub sender: String,
    pub domain_name: String,
    pub display_name: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_plain: Option<String>,
    pub reply_to: Option<String>,
    /// RFC Message-ID of the mail this one answers.
    pub in_reply_to: Option<String>,
    pub in_reply_to_mail_kind: Option<MailKind>,
    pub in_reply_to_mail_id: Option<Uuid>,
    pub message_id: String,
    pub tracking_id: Option<String>,
    pub message: String,
    pub message_size: i64,
    pub created_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub submitted_after: f64,
    pub transferred_at: Option<DateTime<Utc>>,
    pub transferred_after: Option<f64>,
    pub via_api: bool,
    pub is_newsletter: bool,
    pub send_in_batch: bool,
    pub folder: OutgoingFolder,
    pub agent: Option<String>,
    pub queue_id: Option<String>,
    pub status: OutgoingStatus,
    pub error_log: Option<String>,
    pub docstatus: DocStatus,
    pub open_count: i32,
    pub first_opened_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    pub recipients: Vec<MailRecipient>,
    #[sqlx(skip)]
    pub custom_headers: Vec<CustomHeader>,
}

/// Mail-level status as a pure function of the recipient statuses.
pub fn derive_status(recipients: &[MailRecipient]) -> OutgoingStatus {
    let sent = recipients
        .iter()
        .filter(|r| r.status == RecipientStatus::Sent)
        .count();
    let deferred = recipients
        .iter()
        .filter(|r| r.status == RecipientStatus::Deferred)
        .count();

    if sent == recipients.len() && !recipients.is_empty() {
        OutgoingStatus::Sent
    } else if sent > 0 {
        OutgoingStatus::PartiallySent
    } else if deferred == recipients.len() && !recipients.is_empty() {
        OutgoingStatus::Deferred
    } else {
        OutgoingStatus::Bounced
    }
}

/// Recipient statuses only move forward: `Sent` is terminal, a deferral may
/// later bounce or deliver, but a delivered recipient never regresses.
pub fn recipient_advances(current: RecipientStatus, next: RecipientStatus) -> bool {
    match current {
        RecipientStatus::Sent => false,
        RecipientStatus::Bounced => next == RecipientStatus::Sent,
        RecipientStatus::Pending | RecipientStatus::Deferred => next != RecipientStatus::Pending,
    }
}

/// A mail selected for batched transfer, with everything the queue envelope
/// and priority derivation need.
#[derive(Debug, sqlx::FromRow)]
pub struct PendingTransfer {
    pub id: Uuid,
    pub message: String,
    pub is_newsletter: bool,
    pub is_root_domain: bool,
    #[sqlx(skip)]
    pub recipients: Vec<String>,
}

#[derive(Clone)]
pub struct AttachmentRepository {
    pool: PgPool,
}

impl AttachmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save_refs(&self, refs: &[AttachmentRef]) -> Result<(), Error> {
        for attachment in refs {
            sqlx::query(
                r#"
                INSERT INTO mail_attachments
                    (id, mail_kind, mail_id, file_name, file_url, content_type, size, inline)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(attachment.id)
            .bind(attachment.mail_kind)
            .bind(attachment.mail_id)
            .bind(&attachment.file_name)
            .bind(&attachment.file_url)
            .bind(&attachment.content_type)
            .bind(attachment.size)
            .bind(attachment.inline)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn refs_of(&self, kind: MailKind, mail_id: Uuid) -> Result<Vec<AttachmentRef>, Error> {
        Ok(sqlx::query_as::<_, AttachmentRef>(
            "SELECT * FROM mail_attachments WHERE mail_kind = $1 AND mail_id = $2 ORDER BY file_name",
        )
        .bind(kind)
        .bind(mail_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[derive(Clone)]
pub struct OutgoingMailRepository {
    pool: PgPool,
}

impl OutgoingMailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Persist a freshly composed mail with its children in one transaction.
    pub async fn create(&self, mail: &OutgoingMail) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO outgoing_mails
                (id, sender, domain_name, display_name, subject, body_html, body_plain,
                 reply_to, in_reply_to, in_reply_to_mail_kind, in_reply_to_mail_id,
                 message_id, tracking_id, message, message_size,
                 created_at, submitted_at, submitted_after,
                 via_api, is_newsletter, send_in_batch, folder, agent, status, docstatus)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
            "#,
        )
        .bind(mail.id)
        .bind(&mail.sender)
        .bind(&mail.domain_name)
        .bind(&mail.display_name)
        .bind(&mail.subject)
        .bind(&mail.body_html)
        .bind(&mail.body_plain)
        .bind(&mail.reply_to)
        .bind(&mail.in_reply_to)
        .bind(mail.in_reply_to_mail_kind)
        .bind(mail.in_reply_to_mail_id)
        .bind(&mail.message_id)
        .bind(&mail.tracking_id)
        .bind(&mail.message)
        .bind(mail.message_size)
        .bind(mail.created_at)
        .bind(mail.submitted_at)
        .bind(mail.submitted_after)
        .bind(mail.via_api)
        .bind(mail.is_newsletter)
        .bind(mail.send_in_batch)
        .bind(mail.folder)
        .bind(&mail.agent)
        .bind(mail.status)
        .bind(mail.docstatus)
        .execute(&mut *tx)
        .await?;

        for recipient in &mail.recipients {
            sqlx::query(
                r#"
                INSERT INTO outgoing_mail_recipients (mail_id, kind, email, display_name, status, retries)
                VALUES ($1, $2, $3, $4, 'pending', 0)
                "#,
            )
            .bind(mail.id)
            .bind(recipient.kind)
            .bind(&recipient.email)
            .bind(&recipient.display_name)
            .execute(&mut *tx)
            .await?;
        }

        for header in &mail.custom_headers {
            sqlx::query(
                "INSERT INTO outgoing_mail_headers (mail_id, key, value) VALUES ($1, $2, $3)",
            )
            .bind(mail.id)
            .bind(&header.key)
            .bind(&header.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<OutgoingMail, Error> {
        let mut mail = sqlx::query_as::<_, OutgoingMail>("SELECT * FROM outgoing_mails WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("outgoing mail not found"))?;
        mail.recipients = self.recipients_of(id).await?;
        mail.custom_headers = self.headers_of(id).await?;
        Ok(mail)
    }

    pub async fn recipients_of(&self, id: Uuid) -> Result<Vec<MailRecipient>, Error> {
        Ok(sqlx::query_as::<_, MailRecipient>(
            "SELECT * FROM outgoing_mail_recipients WHERE mail_id = $1 ORDER BY email",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn headers_of(&self, id: Uuid) -> Result<Vec<CustomHeader>, Error> {
        Ok(sqlx::query_as::<_, CustomHeader>(
            "SELECT key, value FROM outgoing_mail_headers WHERE mail_id = $1 ORDER BY key",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The message id a threading pointer resolves to.
    pub async fn message_id_of(
        &self,
        kind: MailKind,
        id: Uuid,
    ) -> Result<Option<String>, Error> {
        let table = match kind {
            MailKind::Outgoing => "outgoing_mails",
            MailKind::Incoming => "incoming_mails",
        };
        Ok(
            sqlx::query_scalar::<_, String>(&format!(
                "SELECT message_id FROM {table} WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    /// Reverse threading lookup: which internal mail carries this
    /// Message-ID, if any.
    pub async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<(MailKind, Uuid)>, Error> {
        if let Some(id) =
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM outgoing_mails WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(Some((MailKind::Outgoing, id)));
        }
        if let Some(id) =
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM incoming_mails WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(Some((MailKind::Incoming, id)));
        }
        Ok(None)
    }

    pub async fn set_status(&self, id: Uuid, status: OutgoingStatus) -> Result<(), Error> {
        sqlx::query("UPDATE outgoing_mails SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip one mail `pending -> transferring` ahead of an immediate publish.
    /// Returns false when the mail was no longer pending.
    pub async fn begin_transfer(&self, id: Uuid) -> Result<bool, Error> {
        let updated = sqlx::query(
            "UPDATE outgoing_mails SET status = 'transferring' WHERE id = $1 AND status = 'pending' AND docstatus = 1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn finish_transfer(&self, ids: &[Uuid]) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE outgoing_mails
            SET status = 'transferred',
                error_log = NULL,
                transferred_at = now(),
                transferred_after = EXTRACT(EPOCH FROM (now() - submitted_at))
            WHERE id = ANY($1) AND status = 'transferring'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_transfer(&self, ids: &[Uuid], error_log: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE outgoing_mails SET status = 'failed', error_log = $2 WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(error_log)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Oldest pending batch mails, with the flags priority derivation needs.
    pub async fn select_pending(&self, limit: i64) -> Result<Vec<PendingTransfer>, Error> {
        let mut mails = sqlx::query_as::<_, PendingTransfer>(
            r#"
            SELECT m.id, m.message, m.is_newsletter, d.is_root_domain
            FROM outgoing_mails m
                JOIN mail_domains d ON d.name = m.domain_name
            WHERE m.docstatus = 1 AND m.status = 'pending'
            ORDER BY m.submitted_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = mails.iter().map(|m| m.id).collect();
        let rows = sqlx::query_as::<_, (Uuid, String, Option<String>)>(
            "SELECT mail_id, email, display_name FROM outgoing_mail_recipients WHERE mail_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        for mail in mails.iter_mut() {
            mail.recipients = rows
                .iter()
                .filter(|(id, _, _)| *id == mail.id)
                .map(|(_, email, display_name)| {
                    crate::utils::format_addr(display_name.as_deref(), email)
                })
                .collect();
        }

        Ok(mails)
    }

    /// Flip a batch `pending -> transferring`; only rows still pending move.
    pub async fn begin_transfer_batch(&self, ids: &[Uuid]) -> Result<u64, Error> {
        Ok(sqlx::query(
            "UPDATE outgoing_mails SET status = 'transferring', error_log = NULL
             WHERE id = ANY($1) AND docstatus = 1 AND status = 'pending'",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    /// Operator path back from `Failed`: clear the error, drop out of the
    /// batch and hand the mail back to the transfer pipeline.
    pub async fn retry_failed(&self, id: Uuid) -> Result<bool, Error> {
        let updated = sqlx::query(
            r#"
            UPDATE outgoing_mails
            SET status = 'pending', error_log = NULL, send_in_batch = FALSE
            WHERE id = $1 AND docstatus = 1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn update_bodies(
        &self,
        id: Uuid,
        body_html: &str,
        body_plain: &str,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE outgoing_mails SET body_html = $2, body_plain = $3 WHERE id = $1")
            .bind(id)
            .bind(body_html)
            .bind(body_plain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent open-tracking update in a single statement.
    pub async fn record_open(&self, tracking_id: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE outgoing_mails
            SET first_opened_at = COALESCE(first_opened_at, now()),
                last_opened_at = now(),
                open_count = open_count + 1
            WHERE docstatus = 1 AND tracking_id = $1
            "#,
        )
        .bind(tracking_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn purge_newsletters(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        Ok(
            sqlx::query("DELETE FROM outgoing_mails WHERE is_newsletter AND created_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }

    /// Read-only thread reconstruction: breadth-first walk over the two
    /// threading foreign keys in both directions, with a visited set so
    /// cyclic references terminate.
    pub async fn thread_of(&self, start: (MailKind, Uuid)) -> Result<Vec<(MailKind, Uuid)>, Error> {
        use std::collections::{HashSet, VecDeque};

        let mut visited: HashSet<(MailKind, Uuid)> = HashSet::new();
        let mut queue: VecDeque<(MailKind, Uuid)> = VecDeque::from([start]);
        let mut thread = Vec::new();

        while let Some((kind, id)) = queue.pop_front() {
            if !visited.insert((kind, id)) {
                continue;
            }

            let (message_id, parent) = match kind {
                MailKind::Outgoing => {
                    let Some(row) = sqlx::query_as::<
                        _,
                        (String, Option<MailKind>, Option<Uuid>),
                    >(
                        "SELECT message_id, in_reply_to_mail_kind, in_reply_to_mail_id
                         FROM outgoing_mails WHERE id = $1",
                    )
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
                    else {
                        continue;
                    };
                    let parent = match (row.1, row.2) {
                        (Some(kind), Some(id)) => Some((kind, id)),
                        _ => None,
                    };
                    (row.0, parent)
                }
                MailKind::Incoming => {
                    let Some(row) = sqlx::query_as::<_, (String, Option<String>)>(
                        "SELECT message_id, in_reply_to FROM incoming_mails WHERE id = $1",
                    )
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
                    else {
                        continue;
                    };
                    let parent = match &row.1 {
                        Some(in_reply_to) => self.find_by_message_id(in_reply_to).await?,
                        None => None,
                    };
                    (row.0, parent)
                }
            };

            thread.push((kind, id));
            if let Some(parent) = parent {
                queue.push_back(parent);
            }

            // outgoing replies point at us through the internal FK pair
            let children = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM outgoing_mails
                 WHERE in_reply_to_mail_kind = $1 AND in_reply_to_mail_id = $2",
            )
            .bind(kind)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
            queue.extend(children.into_iter().map(|id| (MailKind::Outgoing, id)));

            // incoming replies reference our Message-ID
            let children = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM incoming_mails WHERE in_reply_to = $1",
            )
            .bind(&message_id)
            .fetch_all(&self.pool)
            .await?;
            queue.extend(children.into_iter().map(|id| (MailKind::Incoming, id)));
        }

        Ok(thread)
    }

    // Reconciler helpers. These run inside the caller's transaction so the
    // recipient updates and the derived mail status commit together.

    pub async fn lock(&self, tx: &mut PgConnection, id: Uuid) -> Result<Option<Uuid>, Error> {
        Ok(
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM outgoing_mails WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(tx)
                .await?,
        )
    }

    pub async fn lock_by_queue_id(
        &self,
        tx: &mut PgConnection,
        queue_id: &str,
    ) -> Result<Option<Uuid>, Error> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM outgoing_mails WHERE queue_id = $1 FOR UPDATE",
        )
        .bind(queue_id)
        .fetch_optional(tx)
        .await?)
    }

    pub async fn set_queued(
        &self,
        tx: &mut PgConnection,
        id: Uuid,
        agent: &str,
        queue_id: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE outgoing_mails SET status = 'queued', agent = $2, queue_id = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(agent)
        .bind(queue_id)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn recipients_for_update(
        &self,
        tx: &mut PgConnection,
        id: Uuid,
    ) -> Result<Vec<MailRecipient>, Error> {
        Ok(sqlx::query_as::<_, MailRecipient>(
            "SELECT * FROM outgoing_mail_recipients WHERE mail_id = $1",
        )
        .bind(id)
        .fetch_all(tx)
        .await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_recipient(
        &self,
        tx: &mut PgConnection,
        id: Uuid,
        email: &str,
        status: RecipientStatus,
        retries: i32,
        action_at: DateTime<Utc>,
        action_after: Option<f64>,
        details: &serde_json::Value,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE outgoing_mail_recipients
            SET status = $3, retries = $4, action_at = $5, action_after = $6, details = $7
            WHERE mail_id = $1 AND email = $2
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(status)
        .bind(retries)
        .bind(action_at)
        .bind(action_after)
        .bind(details)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn set_status_in_tx(
        &self,
        tx: &mut PgConnection,
        id: Uuid,
        status: OutgoingStatus,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE outgoing_mails SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(tx)
            .await?;
        Ok(())
    }

    pub async fn transferred_at_of(
        &self,
        tx: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT transferred_at FROM outgoing_mails WHERE id = $1",
        )
        .bind(id)
        .fetch_one(tx)
        .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn recipient(email: &str, status: RecipientStatus) -> MailRecipient {
        MailRecipient {
            mail_id: Uuid::now_v7(),
            kind: RecipientKind::To,
            email: email.to_owned(),
            display_name: None,
            status,
            retries: 0,
            action_at: None,
            action_after: None,
            details: None,
        }
    }

    #[test]
    fn status_derivation_table() {
        use RecipientStatus::*;

        let all_sent = [recipient("a@x.test", Sent), recipient("b@y.test", Sent)];
        assert_eq!(derive_status(&all_sent), OutgoingStatus::Sent);

        let partial = [recipient("a@x.test", Sent), recipient("b@y.test", Bounced)];
        assert_eq!(derive_status(&partial), OutgoingStatus::PartiallySent);

        let partial_deferred = [recipient("a@x.test", Sent), recipient("b@y.test", Deferred)];
        assert_eq!(derive_status(&partial_deferred), OutgoingStatus::PartiallySent);

        let all_deferred = [
            recipient("a@x.test", Deferred),
            recipient("b@y.test", Deferred),
        ];
        assert_eq!(derive_status(&all_deferred), OutgoingStatus::Deferred);

        let bounced = [
            recipient("a@x.test", Bounced),
            recipient("b@y.test", Deferred),
        ];
        assert_eq!(derive_status(&bounced), OutgoingStatus::Bounced);
    }

    #[test]
    fn recipient_status_is_forward_only() {
        use RecipientStatus::*;

        assert!(recipient_advances(Pending, Deferred));
        assert!(recipient_advances(Pending, Sent));
        assert!(recipient_advances(Deferred, Sent));
        assert!(recipient_advances(Deferred, Bounced));
        assert!(recipient_advances(Bounced, Sent));

        // delivered recipients never regress
        assert!(!recipient_advances(Sent, Deferred));
        assert!(!recipient_advances(Sent, Bounced));
        assert!(!recipient_advances(Sent, Sent));
        // and nothing moves back to pending
        assert!(!recipient_advances(Deferred, Pending));
    }
}
