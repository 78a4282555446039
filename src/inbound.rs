use askama::Template;
use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, INCOMING_MAIL_QUEUE};
use crate::compose::{Composer, Submission};
use crate::config::MailSettings;
use crate::context::Context;
use crate::error::MailError;
use crate::events::{EventBus, MailEvent};
use crate::models::{
    AliasRepository, AttachmentRef, AttachmentRepository, DocStatus, DomainRepository,
    IncomingFolder, IncomingMail, IncomingMailRepository, IncomingStatus, MailDomain, MailKind,
    MailRecipient, Mailbox, MailboxRepository, NewSpamCheckLog, RecipientStatus,
    SpamCheckLogRepository,
};
use crate::parser::{rewrite_cid_references, ParsedMail};
use crate::spam::SpamChecker;
use crate::store::DocumentStore;

pub const REJECTION_MESSAGE: &str = "550 5.4.1 Recipient address rejected: Access denied.";

/// Where an accepted message goes: one or more destination mailboxes, or
/// the rejection path.
#[derive(Debug, PartialEq)]
pub enum Route {
    Deliver(Vec<String>),
    Reject,
}

/// Receiver classification, leaves-first: a disabled or unknown domain
/// rejects, an enabled alias fans out to its enabled destinations, an
/// enabled incoming mailbox delivers to itself, anything else rejects.
pub fn resolve_route(
    domain: Option<&MailDomain>,
    alias_destinations: Option<&[Mailbox]>,
    mailbox: Option<&Mailbox>,
) -> Route {
    let Some(domain) = domain else {
        return Route::Reject;
    };
    if !domain.enabled {
        return Route::Reject;
    }

    if let Some(destinations) = alias_destinations {
        let emails: Vec<String> = destinations
            .iter()
            .filter(|m| m.check_incoming().is_ok())
            .map(|m| m.email.clone())
            .collect();
        return if emails.is_empty() {
            Route::Reject
        } else {
            Route::Deliver(emails)
        };
    }

    if let Some(mailbox) = mailbox {
        if mailbox.check_incoming().is_ok() {
            return Route::Deliver(vec![mailbox.email.clone()]);
        }
    }

    Route::Reject
}

/// Folder, status and timing derivation for one incoming mail.
pub fn finalize_incoming(
    mail: &mut IncomingMail,
    spam_score: f64,
    max_spam_score: f64,
    spam_detection_enabled: bool,
    now: DateTime<Utc>,
) {
    mail.spam_score = spam_score;
    mail.is_spam = spam_detection_enabled && spam_score > max_spam_score;
    mail.folder = if mail.is_spam {
        IncomingFolder::Spam
    } else {
        IncomingFolder::Inbox
    };
    mail.status = if mail.is_rejected {
        IncomingStatus::Rejected
    } else {
        IncomingStatus::Accepted
    };
    mail.received_after = crate::utils::diff_seconds(mail.received_at, mail.created_at).max(0.0);
    mail.processed_at = now;
    mail.processed_after = crate::utils::diff_seconds(now, mail.received_at).max(0.0);
}

#[derive(Template)]
#[template(path = "undeliverable.html")]
struct UndeliverableNotice {
    receiver: String,
    rejection_message: String,
    headers: Vec<String>,
}

/// Header lines of a raw message, for embedding in the bounce notice.
fn header_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .take_while(|line| !line.trim().is_empty())
        .map(|line| line.to_owned())
        .collect()
}

/// Consumes the incoming queue: parses each accepted message, routes it to
/// mailboxes (with alias fan-out), rejects unknown receivers and notifies
/// their senders through the postmaster.
pub struct IntakeWorker {
    domains: DomainRepository,
    mailboxes: MailboxRepository,
    aliases: AliasRepository,
    incoming: IncomingMailRepository,
    attachments: AttachmentRepository,
    spam_logs: SpamCheckLogRepository,
    store: Arc<dyn DocumentStore>,
    spam: SpamChecker,
    composer: Arc<Composer>,
    broker: Broker,
    events: EventBus,
    settings: MailSettings,
}

impl IntakeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: sqlx::PgPool,
        store: Arc<dyn DocumentStore>,
        composer: Arc<Composer>,
        broker: Broker,
        events: EventBus,
        settings: MailSettings,
    ) -> Self {
        Self {
            domains: DomainRepository::new(pool.clone()),
            mailboxes: MailboxRepository::new(pool.clone()),
            aliases: AliasRepository::new(pool.clone()),
            incoming: IncomingMailRepository::new(pool.clone()),
            attachments: AttachmentRepository::new(pool.clone()),
            spam_logs: SpamCheckLogRepository::new(pool),
            spam: SpamChecker::new(&settings),
            store,
            composer,
            broker,
            events,
            settings,
        }
    }

    /// Drain the incoming queue. Undeliverable *messages* (malformed,
    /// invalid addresses) are logged and dropped; infrastructure errors
    /// leave the message on the queue for redelivery.
    pub async fn run_once(&self) -> Result<u64, MailError> {
        self.broker.declare_queue(INCOMING_MAIL_QUEUE, 0).await?;
        self.broker
            .drain(INCOMING_MAIL_QUEUE, |body, app_id| async move {
                self.ingest(body, app_id).await
            })
            .await
    }

    pub async fn ingest(&self, raw: Vec<u8>, agent: Option<String>) -> Result<(), MailError> {
        let received_at = Utc::now();

        let parsed = match ParsedMail::parse(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping unparseable incoming message: {e}");
                return Ok(());
            }
        };

        let Some(sender) = parsed.sender() else {
            warn!("dropping incoming message without a From address");
            return Ok(());
        };
        let Some(receiver) = parsed.delivered_to() else {
            warn!("dropping incoming message without Delivered-To");
            return Ok(());
        };
        if !EmailAddress::is_valid(&sender.email) || !EmailAddress::is_valid(&receiver) {
            warn!(
                sender = sender.email,
                receiver, "dropping incoming message with invalid addresses"
            );
            return Ok(());
        }

        let domain_name = crate::utils::domain_of(&receiver).to_owned();
        let domain = self.domains.get(&domain_name).await?;

        let alias_destinations = match self.aliases.get(&receiver).await? {
            Some(alias) if alias.enabled => Some(self.aliases.destinations(&receiver).await?),
            _ => None,
        };
        let mailbox = self.mailboxes.get(&receiver).await?;

        let route = resolve_route(
            domain.as_ref(),
            alias_destinations.as_deref(),
            mailbox.as_ref(),
        );

        let raw_text = String::from_utf8_lossy(&raw).into_owned();
        match route {
            Route::Deliver(destinations) => {
                for destination in destinations {
                    self.deliver(
                        &parsed,
                        &raw_text,
                        &destination,
                        &domain_name,
                        agent.as_deref(),
                        received_at,
                        false,
                    )
                    .await?;
                }
            }
            Route::Reject => {
                info!(receiver, "rejecting incoming mail for unknown receiver");
                self.deliver(
                    &parsed,
                    &raw_text,
                    &receiver,
                    &domain_name,
                    agent.as_deref(),
                    received_at,
                    true,
                )
                .await?;
                if self.settings.send_notification_on_reject {
                    if let Err(e) = self.send_rejection_notice(&parsed, &receiver).await {
                        warn!(receiver, "could not send rejection notice: {e}");
                    }
                }
            }
        }

        Ok(())
    }

    /// Create one `IncomingMail` row for a destination mailbox, spam-scored
    /// and finalized independently.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        parsed: &ParsedMail<'_>,
        raw_text: &str,
        receiver: &str,
        domain_name: &str,
        agent: Option<&str>,
        received_at: DateTime<Utc>,
        is_rejected: bool,
    ) -> Result<(), MailError> {
        let id = Uuid::now_v7();
        let Some(sender) = parsed.sender() else {
            return Err(MailError::CorruptMessage("missing From address".to_owned()));
        };
        let (from_ip, from_host) = parsed.source_ip_and_host();
        let auth = parsed.authentication_results();
        let created_at = parsed.date().unwrap_or(received_at);

        let mut content = parsed.extract_content();

        // persist attachments, then swap cid references for their URLs
        let mut refs = Vec::with_capacity(content.attachments.len());
        let mut cid_map = Vec::new();
        for attachment in &content.attachments {
            let file = self
                .store
                .save(&attachment.file_name, &attachment.content, true)
                .await?;
            if let Some(cid) = &attachment.content_id {
                cid_map.push((cid.clone(), file.file_url.clone()));
            }
            refs.push(AttachmentRef {
                id: file.id,
                mail_kind: MailKind::Incoming,
                mail_id: id,
                file_name: file.file_name,
                file_url: file.file_url,
                content_type: attachment.content_type.clone(),
                size: attachment.content.len() as i64,
                inline: attachment.inline,
            });
        }
        rewrite_cid_references(&mut content.body_html, &mut content.body_plain, &cid_map);

        let spam_score = if self.spam.is_enabled() && !is_rejected {
            match self.spam.scan(raw_text).await {
                Ok(outcome) => {
                    self.spam_logs
                        .create(&NewSpamCheckLog {
                            message: raw_text.to_owned(),
                            source_ip_address: from_ip.clone(),
                            source_host: from_host.clone(),
                            scanning_mode: self.spam.mode().as_str().to_owned(),
                            hybrid_scanning_threshold: match self.spam.mode() {
                                crate::spam::ScanningMode::Hybrid { threshold } => Some(threshold),
                                _ => None,
                            },
                            spam_score: outcome.score,
                            spam_headers: serde_json::to_value(&outcome.headers)
                                .map_err(|e| MailError::Storage(e.into()))?,
                        })
                        .await?;
                    outcome.score
                }
                Err(e) => {
                    warn!("spam scan failed, accepting unscored: {e}");
                    0.0
                }
            }
        } else {
            0.0
        };

        let recipients = parsed
            .recipients()
            .into_iter()
            .map(|(kind, addr)| MailRecipient {
                mail_id: id,
                kind,
                email: addr.email,
                display_name: addr.display_name,
                status: RecipientStatus::Pending,
                retries: 0,
                action_at: None,
                action_after: None,
                details: None,
            })
            .collect();

        let mut mail = IncomingMail {
            id,
            receiver: receiver.to_owned(),
            domain_name: domain_name.to_owned(),
            sender: sender.email,
            display_name: sender.display_name,
            subject: parsed.subject(),
            body_html: Some(content.body_html.clone()),
            body_plain: Some(content.body_plain.clone()),
            reply_to: parsed.reply_to(),
            message_id: parsed
                .message_id()
                .unwrap_or_else(|| crate::utils::make_msgid(domain_name)),
            in_reply_to: parsed.in_reply_to(),
            message: raw_text.to_owned(),
            message_size: raw_text.len() as i64,
            from_ip,
            from_host,
            agent: agent.map(|a| a.to_owned()),
            created_at,
            received_at,
            received_after: 0.0,
            processed_at: received_at,
            processed_after: 0.0,
            is_spam: false,
            spam_score: 0.0,
            is_rejected,
            rejection_message: is_rejected.then(|| REJECTION_MESSAGE.to_owned()),
            folder: IncomingFolder::Inbox,
            status: IncomingStatus::Accepted,
            spf_pass: auth.spf_pass,
            spf_description: auth.spf_description,
            dkim_pass: auth.dkim_pass,
            dkim_description: auth.dkim_description,
            dmarc_pass: auth.dmarc_pass,
            dmarc_description: auth.dmarc_description,
            docstatus: DocStatus::Submitted,
            recipients,
        };

        finalize_incoming(
            &mut mail,
            spam_score,
            self.settings.max_spam_score_for_inbound,
            self.settings.enable_spam_detection,
            Utc::now(),
        );

        self.incoming.create(&mail).await?;
        self.attachments.save_refs(&refs).await?;
        debug!(mail_id = %mail.id, receiver, "incoming mail stored");

        self.events.publish(MailEvent::IncomingMailReceived {
            mailbox: receiver.to_owned(),
            mail_id: mail.id,
        });

        Ok(())
    }

    /// Bounce for a rejected receiver, sent from the postmaster to the
    /// original Reply-To or From address.
    async fn send_rejection_notice(
        &self,
        parsed: &ParsedMail<'_>,
        receiver: &str,
    ) -> Result<(), MailError> {
        let notify = parsed
            .reply_to()
            .or_else(|| parsed.sender().map(|s| s.email))
            .ok_or_else(|| MailError::CorruptMessage("no address to notify".to_owned()))?;

        let raw = String::from_utf8_lossy(parsed.raw()).into_owned();
        let notice = UndeliverableNotice {
            receiver: receiver.to_owned(),
            rejection_message: REJECTION_MESSAGE.to_owned(),
            headers: header_lines(&raw),
        }
        .render()
        .map_err(|e| MailError::CorruptMessage(e.to_string()))?;

        let submission = Submission {
            sender: self.settings.postmaster.clone(),
            to: vec![notify],
            subject: format!("Undeliverable: {}", parsed.subject()),
            body_html: Some(notice),
            ..Default::default()
        };

        let ctx = Context::system(&self.settings.postmaster);
        let mail = self.composer.submit(&ctx, submission).await?;
        info!(bounce_id = %mail.id, receiver, "rejection notice queued");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::MailboxStatus;

    fn domain(enabled: bool) -> MailDomain {
        MailDomain {
            name: "example.test".to_owned(),
            enabled,
            is_verified: true,
            is_root_domain: false,
            dkim_key_size: 2048,
            newsletter_retention: 7,
            outgoing_agent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn mailbox(email: &str) -> Mailbox {
        Mailbox {
            email: email.to_owned(),
            domain_name: "example.test".to_owned(),
            user: "alice".to_owned(),
            enabled: true,
            incoming: true,
            outgoing: true,
            status: MailboxStatus::Active,
            is_default: false,
            display_name: None,
            track_outgoing_mail: false,
            create_mail_contact: false,
            override_display_name: false,
            override_reply_to: false,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn unknown_or_disabled_domain_rejects() {
        assert_eq!(resolve_route(None, None, None), Route::Reject);
        assert_eq!(
            resolve_route(Some(&domain(false)), None, Some(&mailbox("a@example.test"))),
            Route::Reject
        );
    }

    #[test]
    fn alias_fans_out_to_enabled_destinations() {
        let destinations = vec![mailbox("a@example.test"), mailbox("b@example.test")];
        assert_eq!(
            resolve_route(Some(&domain(true)), Some(&destinations), None),
            Route::Deliver(vec![
                "a@example.test".to_owned(),
                "b@example.test".to_owned()
            ])
        );

        // disabled destinations are skipped
        let mut half_disabled = destinations.clone();
        half_disabled[0].enabled = false;
        assert_eq!(
            resolve_route(Some(&domain(true)), Some(&half_disabled), None),
            Route::Deliver(vec!["b@example.test".to_owned()])
        );

        let all_disabled: Vec<Mailbox> = destinations
            .into_iter()
            .map(|m| Mailbox {
                enabled: false,
                ..m
            })
            .collect();
        assert_eq!(
            resolve_route(Some(&domain(true)), Some(&all_disabled), None),
            Route::Reject
        );
    }

    #[test]
    fn direct_mailbox_delivery_requires_incoming() {
        assert_eq!(
            resolve_route(Some(&domain(true)), None, Some(&mailbox("a@example.test"))),
            Route::Deliver(vec!["a@example.test".to_owned()])
        );

        let outgoing_only = Mailbox {
            incoming: false,
            ..mailbox("a@example.test")
        };
        assert_eq!(
            resolve_route(Some(&domain(true)), None, Some(&outgoing_only)),
            Route::Reject
        );

        assert_eq!(resolve_route(Some(&domain(true)), None, None), Route::Reject);
    }

    fn incoming_mail() -> IncomingMail {
        let now = Utc::now();
        IncomingMail {
            id: Uuid::now_v7(),
            receiver: "alice@example.test".to_owned(),
            domain_name: "example.test".to_owned(),
            sender: "bob@peer.test".to_owned(),
            display_name: None,
            subject: "Hi".to_owned(),
            body_html: None,
            body_plain: None,
            reply_to: None,
            message_id: "<x@peer.test>".to_owned(),
            in_reply_to: None,
            message: String::new(),
            message_size: 0,
            from_ip: None,
            from_host: None,
            agent: None,
            created_at: now - chrono::Duration::seconds(30),
            received_at: now - chrono::Duration::seconds(10),
            received_after: 0.0,
            processed_at: now,
            processed_after: 0.0,
            is_spam: false,
            spam_score: 0.0,
            is_rejected: false,
            rejection_message: None,
            folder: IncomingFolder::Inbox,
            status: IncomingStatus::Accepted,
            spf_pass: false,
            spf_description: String::new(),
            dkim_pass: false,
            dkim_description: String::new(),
            dmarc_pass: false,
            dmarc_description: String::new(),
            docstatus: DocStatus::Submitted,
            recipients: vec![],
        }
    }

    #[test]
    fn finalize_computes_folder_status_and_timings() {
        let now = Utc::now();

        let mut accepted = incoming_mail();
        finalize_incoming(&mut accepted, 2.0, 5.0, true, now);
        assert!(!accepted.is_spam);
        assert_eq!(accepted.folder, IncomingFolder::Inbox);
        assert_eq!(accepted.status, IncomingStatus::Accepted);
        assert!(accepted.received_after >= 19.0 && accepted.received_after <= 21.0);
        assert!(accepted.processed_after >= 9.0 && accepted.processed_after <= 11.0);
        assert_eq!(accepted.processed_at, now);

        let mut spammy = incoming_mail();
        finalize_incoming(&mut spammy, 7.5, 5.0, true, now);
        assert!(spammy.is_spam);
        assert_eq!(spammy.folder, IncomingFolder::Spam);

        // score over threshold but detection off
        let mut unscanned = incoming_mail();
        finalize_incoming(&mut unscanned, 7.5, 5.0, false, now);
        assert!(!unscanned.is_spam);

        let mut rejected = incoming_mail();
        rejected.is_rejected = true;
        finalize_incoming(&mut rejected, 0.0, 5.0, true, now);
        assert_eq!(rejected.status, IncomingStatus::Rejected);
    }

    #[test]
    fn undeliverable_notice_embeds_original_headers() {
        let raw = "From: bob@peer.test\r\nTo: ghost@example.test\r\nSubject: hello\r\n\r\nbody\r\n";
        let notice = UndeliverableNotice {
            receiver: "ghost@example.test".to_owned(),
            rejection_message: REJECTION_MESSAGE.to_owned(),
            headers: header_lines(raw),
        }
        .render()
        .unwrap();

        assert!(notice.contains("ghost@example.test"));
        assert!(notice.contains("550 5.4.1"));
        assert!(notice.contains("Subject: hello"));
        assert!(!notice.contains("body"));
    }
}
