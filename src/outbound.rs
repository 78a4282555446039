use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, OUTGOING_MAIL_QUEUE};
use crate::config::MailSettings;
use crate::error::MailError;
use crate::models::{OutgoingMail, OutgoingMailRepository, PendingTransfer};
use crate::utils::format_addr;

/// Highest priority, reserved for interactive API submissions.
pub const PRIORITY_IMMEDIATE: u8 = 3;
/// Seconds after submission within which a mail still counts as
/// interactive.
const IMMEDIATE_WINDOW_SECS: f64 = 5.0;

const MAX_TRANSFER_ATTEMPTS: u32 = 3;
const TRANSFER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Body published to the outgoing queue. The uuid makes redelivery
/// idempotent: agents deduplicate on it.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TransferEnvelope {
    pub outgoing_mail: Uuid,
    pub recipients: Vec<String>,
    pub message: String,
}

/// Queue priority for a batched mail: newsletters drain last, root-domain
/// traffic overtakes tenant domains, and the interactive path (3) beats
/// them all.
pub fn queue_priority(is_newsletter: bool, is_root_domain: bool) -> u8 {
    if is_newsletter {
        0
    } else if is_root_domain {
        2
    } else {
        1
    }
}

/// Whether a just-submitted mail takes the immediate path instead of
/// waiting for the cron drain.
pub fn is_immediate(mail: &OutgoingMail) -> bool {
    mail.via_api
        && !mail.is_newsletter
        && !mail.send_in_batch
        && mail.submitted_after <= IMMEDIATE_WINDOW_SECS
}

/// Moves pending outgoing mails onto the broker, immediately for API
/// submissions and in cron-driven batches for everything else.
#[derive(Clone)]
pub struct TransferWorker {
    repository: OutgoingMailRepository,
    broker: Broker,
    max_batch_size: i64,
}

impl TransferWorker {
    pub fn new(pool: sqlx::PgPool, broker: Broker, settings: &MailSettings) -> Self {
        Self {
            repository: OutgoingMailRepository::new(pool),
            broker,
            max_batch_size: settings.max_batch_size,
        }
    }

    fn envelope(mail: &OutgoingMail) -> TransferEnvelope {
        TransferEnvelope {
            outgoing_mail: mail.id,
            recipients: mail
                .recipients
                .iter()
                .map(|r| format_addr(r.display_name.as_deref(), &r.email))
                .collect(),
            message: mail.message.clone(),
        }
    }

    /// Publish one mail at top priority right after submission. The flip to
    /// `Transferring` commits before the publish; a failed publish leaves
    /// the mail `Failed` with the error recorded, never back at `Pending`.
    pub async fn transfer_now(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        if !is_immediate(mail) {
            return Ok(());
        }
        if !self.repository.begin_transfer(mail.id).await? {
            // someone else picked it up, e.g. the batch drain
            return Ok(());
        }

        let body = serde_json::to_vec(&Self::envelope(mail))
            .map_err(|e| MailError::Storage(e.into()))?;

        self.broker
            .declare_queue(OUTGOING_MAIL_QUEUE, PRIORITY_IMMEDIATE)
            .await?;
        match self
            .broker
            .publish(OUTGOING_MAIL_QUEUE, &body, PRIORITY_IMMEDIATE)
            .await
        {
            Ok(()) => {
                self.repository.finish_transfer(&[mail.id]).await?;
                info!(mail_id = %mail.id, "mail transferred to broker");
                Ok(())
            }
            Err(e) => {
                self.repository
                    .fail_transfer(&[mail.id], &e.to_string())
                    .await?;
                error!(mail_id = %mail.id, "immediate transfer failed: {e}");
                Err(e)
            }
        }
    }

    async fn publish_batch(&self, mails: &[PendingTransfer]) -> Result<(), MailError> {
        self.broker
            .declare_queue(OUTGOING_MAIL_QUEUE, PRIORITY_IMMEDIATE)
            .await?;
        for mail in mails {
            let envelope = TransferEnvelope {
                outgoing_mail: mail.id,
                recipients: mail.recipients.clone(),
                message: mail.message.clone(),
            };
            let body =
                serde_json::to_vec(&envelope).map_err(|e| MailError::Storage(e.into()))?;
            let priority = queue_priority(mail.is_newsletter, mail.is_root_domain);
            self.broker
                .publish(OUTGOING_MAIL_QUEUE, &body, priority)
                .await?;
        }
        Ok(())
    }

    /// Cron entry point: drain pending mails in batches until none are
    /// left, retrying a failing broker up to three times with a five second
    /// pause. Mails caught in a failing attempt stay `Failed` with the
    /// error log until an operator retries them.
    pub async fn transfer_pending(&self) -> Result<(), MailError> {
        let mut failures = 0u32;

        loop {
            let mails = self.repository.select_pending(self.max_batch_size).await?;
            if mails.is_empty() {
                return Ok(());
            }

            let ids: Vec<Uuid> = mails.iter().map(|m| m.id).collect();
            self.repository.begin_transfer_batch(&ids).await?;

            match self.publish_batch(&mails).await {
                Ok(()) => {
                    self.repository.finish_transfer(&ids).await?;
                    info!(count = ids.len(), "batch transferred to broker");
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, "batch transfer failed: {e}");
                    self.repository.fail_transfer(&ids, &e.to_string()).await?;
                    if failures >= MAX_TRANSFER_ATTEMPTS {
                        return Err(e);
                    }
                    tokio::time::sleep(TRANSFER_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{
        DocStatus, OutgoingFolder, OutgoingStatus, RecipientKind, RecipientStatus,
    };
    use chrono::Utc;

    #[test]
    fn priorities_follow_the_contract() {
        assert_eq!(queue_priority(true, false), 0);
        assert_eq!(queue_priority(true, true), 0);
        assert_eq!(queue_priority(false, false), 1);
        assert_eq!(queue_priority(false, true), 2);
        assert_eq!(PRIORITY_IMMEDIATE, 3);
    }

    fn mail(via_api: bool, is_newsletter: bool, submitted_after: f64) -> OutgoingMail {
        OutgoingMail {
            id: Uuid::now_v7(),
            sender: "alice@example.test".to_owned(),
            domain_name: "example.test".to_owned(),
            display_name: None,
            subject: "Hi".to_owned(),
            body_html: None,
            body_plain: None,
            reply_to: None,
            in_reply_to: None,
            in_reply_to_mail_kind: None,
            in_reply_to_mail_id: None,
            message_id: "<x@example.test>".to_owned(),
            tracking_id: None,
            message: "Subject: Hi\r\n\r\nHi\r\n".to_owned(),
            message_size: 20,
            created_at: Utc::now(),
            submitted_at: Utc::now(),
            submitted_after,
            transferred_at: None,
            transferred_after: None,
            via_api,
            is_newsletter,
            send_in_batch: false,
            folder: OutgoingFolder::Sent,
            agent: None,
            queue_id: None,
            status: OutgoingStatus::Pending,
            error_log: None,
            docstatus: DocStatus::Submitted,
            open_count: 0,
            first_opened_at: None,
            last_opened_at: None,
            recipients: vec![crate::models::MailRecipient {
                mail_id: Uuid::nil(),
                kind: RecipientKind::To,
                email: "bob@peer.test".to_owned(),
                display_name: Some("Bob".to_owned()),
                status: RecipientStatus::Pending,
                retries: 0,
                action_at: None,
                action_after: None,
                details: None,
            }],
            custom_headers: vec![],
        }
    }

    #[test]
    fn immediate_path_needs_api_flag_and_freshness() {
        assert!(is_immediate(&mail(true, false, 1.0)));
        assert!(is_immediate(&mail(true, false, 5.0)));
        assert!(!is_immediate(&mail(true, false, 5.1)));
        assert!(!is_immediate(&mail(false, false, 1.0)));
        assert!(!is_immediate(&mail(true, true, 1.0)));

        let batched = OutgoingMail {
            send_in_batch: true,
            ..mail(true, false, 1.0)
        };
        assert!(!is_immediate(&batched));
    }

    #[test]
    fn envelope_carries_uuid_and_formatted_recipients() {
        let mail = mail(true, false, 1.0);
        let envelope = TransferWorker::envelope(&mail);
        assert_eq!(envelope.outgoing_mail, mail.id);
        assert_eq!(envelope.recipients, vec!["Bob <bob@peer.test>".to_owned()]);
        assert_eq!(envelope.message, mail.message);

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("outgoing_mail").is_some());
        assert!(json.get("recipients").is_some());
        assert!(json.get("message").is_some());
    }
}
