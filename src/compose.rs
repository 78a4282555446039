use chrono::{DateTime, Utc};
use mail_builder::headers::{address::Address, raw::Raw};
use mail_builder::MessageBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::MailSettings;
use crate::context::Context;
use crate::dkim::DomainSigner;
use crate::error::{MailError, ValidationError};
use crate::models::{
    AttachmentRef, AttachmentRepository, ContactRepository, CustomHeader, DocStatus,
    DomainRepository, Error as StorageError, MailDomain, MailKind, MailRecipient, Mailbox,
    MailboxRepository, OutgoingFolder, OutgoingMail, OutgoingMailRepository, OutgoingStatus,
    RecipientKind, RecipientStatus,
};
use crate::parser::{rewrite_cid_references, ParsedMail};
use crate::store::{DocumentStore, StoredFile};
use crate::utils;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUpload {
    pub filename: String,
    pub content: Vec<u8>,
}

/// One submission, structured or raw. When `raw_message` is set it
/// overrides the structured body fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Submission {
    pub sender: String,
    pub display_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub reply_to: Option<String>,
    pub in_reply_to_mail: Option<(MailKind, Uuid)>,
    pub custom_headers: Vec<CustomHeader>,
    pub attachments: Vec<AttachmentUpload>,
    pub raw_message: Option<String>,
    pub via_api: bool,
    pub is_newsletter: bool,
    pub send_in_batch: bool,
}

/// An upload that has already landed in the document store, carried through
/// the MIME build so inline detection can flip it.
#[derive(Debug, Clone)]
pub struct PreparedAttachment {
    pub file: StoredFile,
    pub content: Vec<u8>,
    pub content_type: String,
    pub inline: bool,
}

fn img_src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<img[^>]*?src=['"]([^'"]+)['"]"#).unwrap())
}

pub(crate) fn guess_content_type(filename: &str) -> &'static str {
    match filename.rsplit('.').next().map(|e| e.to_lowercase()).as_deref() {
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Parse and deduplicate the recipient lists. Addresses are lowercased and
/// `(kind, email)` must be unique across the whole mail.
pub(crate) fn validate_recipients(
    submission: &Submission,
    max_recipients: usize,
) -> Result<Vec<MailRecipient>, ValidationError> {
    let groups = [
        (RecipientKind::To, &submission.to),
        (RecipientKind::Cc, &submission.cc),
        (RecipientKind::Bcc, &submission.bcc),
    ];

    let count: usize = groups.iter().map(|(_, list)| list.len()).sum();
    if count > max_recipients {
        return Err(ValidationError::RecipientLimitExceeded {
            count,
            max: max_recipients,
        });
    }

    let mut seen = HashSet::new();
    let mut recipients = Vec::with_capacity(count);
    for (kind, list) in groups {
        for raw in list {
            let (display_name, email) = utils::parse_addr(raw)?;
            if !seen.insert((kind, email.clone())) {
                return Err(ValidationError::DuplicateRecipient {
                    kind: kind.as_str(),
                    email,
                });
            }
            recipients.push(MailRecipient {
                mail_id: Uuid::nil(),
                kind,
                email,
                display_name,
                status: RecipientStatus::Pending,
                retries: 0,
                action_at: None,
                action_after: None,
                details: None,
            });
        }
    }

    Ok(recipients)
}

/// Normalise and check the custom headers: an `X-` prefix is enforced,
/// the internal `X-FM-` namespace is off limits, keys must be unique.
pub(crate) fn validate_custom_headers(
    headers: &[CustomHeader],
    max_headers: usize,
) -> Result<Vec<CustomHeader>, ValidationError> {
    if headers.len() > max_headers {
        return Err(ValidationError::HeaderLimitExceeded {
            count: headers.len(),
            max: max_headers,
        });
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(headers.len());
    for header in headers {
        let key = if header.key.to_uppercase().starts_with("X-") {
            header.key.clone()
        } else {
            format!("X-{}", header.key)
        };
        if key.to_uppercase().starts_with("X-FM-") {
            return Err(ValidationError::ForbiddenHeader(key));
        }
        if !seen.insert(key.to_uppercase()) {
            return Err(ValidationError::DuplicateHeader(key));
        }
        out.push(CustomHeader {
            key,
            value: header.value.clone(),
        });
    }

    Ok(out)
}

pub(crate) fn validate_attachments(
    uploads: &[AttachmentUpload],
    settings: &MailSettings,
) -> Result<(), ValidationError> {
    if uploads.len() > settings.outgoing_max_attachments {
        return Err(ValidationError::AttachmentLimitExceeded {
            count: uploads.len(),
            max: settings.outgoing_max_attachments,
        });
    }

    let mut total = 0usize;
    for upload in uploads {
        let size = upload.content.len();
        if size > settings.outgoing_max_attachment_size {
            return Err(ValidationError::AttachmentTooLarge {
                size,
                max: settings.outgoing_max_attachment_size,
            });
        }
        total += size;
    }
    if total > settings.outgoing_total_attachments_size {
        return Err(ValidationError::TotalAttachmentsTooLarge {
            size: total,
            max: settings.outgoing_total_attachments_size,
        });
    }

    Ok(())
}

/// Rewrite `<img src>` references that point at one of the mail's own
/// attachments to `cid:` form, marking those attachments inline.
pub(crate) fn rewrite_inline_images(
    body_html: &str,
    attachments: &mut [PreparedAttachment],
) -> String {
    let mut html = body_html.to_owned();
    let sources: Vec<String> = img_src_re()
        .captures_iter(body_html)
        .map(|c| c[1].to_owned())
        .collect();

    for src in sources {
        // an attachment is referenced by its URL, its bare file name, or a
        // `fid` query parameter carrying the file id
        let fid = url::Url::parse(&src).ok().and_then(|u| {
            u.query_pairs()
                .find(|(key, _)| key == "fid")
                .map(|(_, value)| value.into_owned())
        });
        let matched = attachments.iter_mut().find(|a| {
            src == a.file.file_url
                || src.ends_with(&a.file.file_name)
                || fid.as_deref() == Some(&a.file.id.to_string())
        });
        if let Some(attachment) = matched {
            attachment.inline = true;
            html = html.replace(&src, &format!("cid:{}", attachment.file.id));
        }
    }

    html
}

/// Inject the 1x1 open-tracking pixel at the top of the HTML body. Runs
/// before signing, exactly once per mail.
pub fn inject_tracking_pixel(body_html: &str, site_url: &str, tracking_id: &str) -> String {
    let pixel = format!(
        "<img src=\"{site_url}/api/track/open?id={tracking_id}\" width=\"1\" height=\"1\" style=\"display:none;\">"
    );
    if let Some(pos) = body_html.find("<body>") {
        let mut out = body_html.to_owned();
        out.insert_str(pos + "<body>".len(), &pixel);
        out
    } else {
        format!("<html><body>{pixel}{body_html}</body></html>")
    }
}

/// Everything the pure build step needs besides the submission itself.
pub struct ComposeContext<'a> {
    pub settings: &'a MailSettings,
    pub domain: &'a MailDomain,
    pub mailbox: &'a Mailbox,
    pub signer: &'a DomainSigner,
    /// Message-ID of the mail this one replies to, already resolved.
    pub in_reply_to: Option<String>,
    pub system_manager: bool,
}

fn check_domain(ctx: &ComposeContext) -> Result<(), ValidationError> {
    if ctx.system_manager {
        return Ok(());
    }
    if !ctx.domain.enabled {
        return Err(ValidationError::DomainDisabled(ctx.domain.name.clone()));
    }
    if !ctx.domain.is_verified {
        return Err(ValidationError::DomainUnverified(ctx.domain.name.clone()));
    }
    Ok(())
}

fn effective_display_name(submission: &Submission, mailbox: &Mailbox) -> Option<String> {
    if mailbox.override_display_name {
        mailbox.display_name.clone()
    } else {
        submission
            .display_name
            .clone()
            .or_else(|| mailbox.display_name.clone())
    }
}

fn effective_reply_to(submission: &Submission, mailbox: &Mailbox) -> Option<String> {
    if mailbox.override_reply_to {
        mailbox.reply_to.clone()
    } else {
        submission.reply_to.clone()
    }
}

fn check_message_size(size: usize, settings: &MailSettings) -> Result<(), ValidationError> {
    if size > settings.max_message_size {
        return Err(ValidationError::MessageTooLarge {
            size,
            max: settings.max_message_size,
        });
    }
    Ok(())
}

/// Build, sign and assemble an outgoing mail from structured fields.
pub fn build_structured_mail(
    submission: &Submission,
    ctx: &ComposeContext,
    attachments: &mut [PreparedAttachment],
    now: DateTime<Utc>,
) -> Result<OutgoingMail, MailError> {
    check_domain(ctx)?;
    ctx.mailbox.check_outgoing()?;

    let recipients = validate_recipients(submission, ctx.settings.max_recipients)?;
    let custom_headers =
        validate_custom_headers(&submission.custom_headers, ctx.settings.max_headers)?;

    let id = Uuid::now_v7();
    let message_id = utils::make_msgid(&ctx.domain.name);
    let display_name = effective_display_name(submission, ctx.mailbox);
    let reply_to = effective_reply_to(submission, ctx.mailbox);

    let mut body_html = rewrite_inline_images(
        submission.body_html.as_deref().unwrap_or_default(),
        attachments,
    );

    let tracking_id = if ctx.mailbox.track_outgoing_mail {
        let tracking_id = Uuid::now_v7().simple().to_string();
        body_html = inject_tracking_pixel(&body_html, &ctx.settings.site_url, &tracking_id);
        Some(tracking_id)
    } else {
        None
    };

    let body_plain = utils::html_to_text(&body_html);

    let mut builder = MessageBuilder::new()
        .from(Address::new_address(
            display_name.clone(),
            submission.sender.clone(),
        ))
        .subject(submission.subject.clone())
        .header("Date", Raw::new(now.to_rfc2822()))
        .header("Message-ID", Raw::new(message_id.clone()))
        .header("X-FM-OM", Raw::new(id.to_string()));

    for (kind, list) in [
        (RecipientKind::To, "To"),
        (RecipientKind::Cc, "Cc"),
        (RecipientKind::Bcc, "Bcc"),
    ] {
        let addresses: Vec<Address> = recipients
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Address::new_address(r.display_name.clone(), r.email.clone()))
            .collect();
        if !addresses.is_empty() {
            builder = builder.header(list, Address::new_list(addresses));
        }
    }

    if let Some(reply_to) = &reply_to {
        builder = builder.header("Reply-To", Raw::new(reply_to.clone()));
    }
    if let Some(in_reply_to) = &ctx.in_reply_to {
        builder = builder.header("In-Reply-To", Raw::new(in_reply_to.clone()));
    }
    for header in &custom_headers {
        builder = builder.header(header.key.clone(), Raw::new(header.value.clone()));
    }

    builder = builder
        .text_body(body_plain.clone())
        .html_body(body_html.clone());

    for attachment in attachments.iter() {
        if attachment.inline {
            builder = builder.inline(
                attachment.content_type.clone(),
                attachment.file.id.to_string(),
                attachment.content.clone(),
            );
        } else {
            builder = builder.attachment(
                attachment.content_type.clone(),
                attachment.file.file_name.clone(),
                attachment.content.clone(),
            );
        }
    }

    let unsigned = builder
        .write_to_vec()
        .map_err(|e| MailError::CorruptMessage(e.to_string()))?;
    let unsigned = String::from_utf8(unsigned).map_err(|e| MailError::Storage(e.into()))?;

    let message = ctx.signer.sign(&unsigned)?;
    check_message_size(message.len(), ctx.settings)?;

    // created_at mirrors the Date header that went into the signature
    let created_at = ParsedMail::parse(message.as_bytes())?
        .date()
        .map_err(MailError::Validation)?;
    let submitted_at = now;
    let submitted_after = utils::diff_seconds(submitted_at, created_at).max(0.0);

    Ok(OutgoingMail {
        id,
        sender: submission.sender.to_lowercase(),
        domain_name: ctx.domain.name.clone(),
        display_name,
        subject: submission.subject.clone(),
        body_html: Some(body_html),
        body_plain: Some(body_plain),
        reply_to,
        in_reply_to: ctx.in_reply_to.clone(),
        in_reply_to_mail_kind: submission.in_reply_to_mail.map(|(kind, _)| kind),
        in_reply_to_mail_id: submission.in_reply_to_mail.map(|(_, id)| id),
        message_id,
        tracking_id,
        message_size: message.len() as i64,
        message,
        created_at,
        submitted_at,
        submitted_after,
        transferred_at: None,
        transferred_after: None,
        via_api: submission.via_api,
        is_newsletter: submission.is_newsletter,
        send_in_batch: submission.send_in_batch,
        folder: OutgoingFolder::Sent,
        agent: ctx.domain.outgoing_agent.clone(),
        queue_id: None,
        status: OutgoingStatus::Pending,
        error_log: None,
        docstatus: DocStatus::Submitted,
        open_count: 0,
        first_opened_at: None,
        last_opened_at: None,
        recipients,
        custom_headers,
    })
}

/// Build an outgoing mail from a caller-provided raw RFC 5322 message. The
/// raw message overrides the structured body fields; the From line is
/// reinjected as `display_name <sender>` and Reply-To follows the mailbox
/// override policy.
pub fn build_raw_mail(
    submission: &Submission,
    ctx: &ComposeContext,
    raw_message: &str,
    now: DateTime<Utc>,
) -> Result<OutgoingMail, MailError> {
    check_domain(ctx)?;
    ctx.mailbox.check_outgoing()?;

    let recipients = validate_recipients(submission, ctx.settings.max_recipients)?;
    let custom_headers =
        validate_custom_headers(&submission.custom_headers, ctx.settings.max_headers)?;

    let parsed = ParsedMail::parse(raw_message.as_bytes())?;
    let created_at = parsed.date().map_err(MailError::Validation)?;
    if created_at > now {
        return Err(ValidationError::FutureDated.into());
    }

    let subject = parsed.subject();
    let message_id = parsed
        .message_id()
        .unwrap_or_else(|| utils::make_msgid(&ctx.domain.name));
    let in_reply_to = ctx.in_reply_to.clone().or_else(|| parsed.in_reply_to());
    let display_name = effective_display_name(submission, ctx.mailbox);
    let content = parsed.extract_content();

    let id = Uuid::now_v7();
    let mut message = raw_message.to_owned();
    message = utils::set_raw_header(
        &message,
        "From",
        &utils::format_addr(display_name.as_deref(), &submission.sender),
    );
    message = utils::set_raw_header(&message, "Message-ID", &message_id);

    let reply_to = if ctx.mailbox.override_reply_to {
        message = utils::remove_raw_header(&message, "Reply-To");
        if let Some(reply_to) = &ctx.mailbox.reply_to {
            message = utils::set_raw_header(&message, "Reply-To", reply_to);
        }
        ctx.mailbox.reply_to.clone()
    } else {
        parsed.reply_to()
    };

    message = utils::set_raw_header(&message, "X-FM-OM", &id.to_string());

    for header in &custom_headers {
        message = utils::set_raw_header(&message, &header.key, &header.value);
    }

    let message = ctx.signer.sign(&message)?;
    check_message_size(message.len(), ctx.settings)?;

    let submitted_at = now;
    let submitted_after = utils::diff_seconds(submitted_at, created_at).max(0.0);

    Ok(OutgoingMail {
        id,
        sender: submission.sender.to_lowercase(),
        domain_name: ctx.domain.name.clone(),
        display_name,
        subject,
        body_html: Some(content.body_html),
        body_plain: Some(content.body_plain),
        reply_to,
        in_reply_to,
        in_reply_to_mail_kind: submission.in_reply_to_mail.map(|(kind, _)| kind),
        in_reply_to_mail_id: submission.in_reply_to_mail.map(|(_, id)| id),
        message_id,
        tracking_id: None,
        message_size: message.len() as i64,
        message,
        created_at,
        submitted_at,
        submitted_after,
        transferred_at: None,
        transferred_after: None,
        via_api: submission.via_api,
        is_newsletter: submission.is_newsletter,
        send_in_batch: submission.send_in_batch,
        folder: OutgoingFolder::Sent,
        agent: ctx.domain.outgoing_agent.clone(),
        queue_id: None,
        status: OutgoingStatus::Pending,
        error_log: None,
        docstatus: DocStatus::Submitted,
        open_count: 0,
        first_opened_at: None,
        last_opened_at: None,
        recipients,
        custom_headers,
    })
}

/// Submission front door: loads the sender's mailbox, domain and signing
/// key, runs the pure build, persists the aggregate and its attachment
/// references, and maintains the opt-in contact book.
pub struct Composer {
    domains: DomainRepository,
    mailboxes: MailboxRepository,
    outgoing: OutgoingMailRepository,
    attachments: AttachmentRepository,
    contacts: ContactRepository,
    store: Arc<dyn DocumentStore>,
    settings: MailSettings,
    domain_cache: TtlCache<String, MailDomain>,
    signer_cache: TtlCache<String, Arc<DomainSigner>>,
}

impl Composer {
    pub fn new(
        pool: sqlx::PgPool,
        store: Arc<dyn DocumentStore>,
        settings: MailSettings,
    ) -> Self {
        Self {
            domains: DomainRepository::new(pool.clone()),
            mailboxes: MailboxRepository::new(pool.clone()),
            outgoing: OutgoingMailRepository::new(pool.clone()),
            attachments: AttachmentRepository::new(pool.clone()),
            contacts: ContactRepository::new(pool),
            store,
            settings,
            domain_cache: TtlCache::new(Duration::from_secs(60)),
            signer_cache: TtlCache::new(Duration::from_secs(60)),
        }
    }

    async fn cached_domain(&self, name: &str) -> Result<MailDomain, MailError> {
        let key = name.to_lowercase();
        if let Some(domain) = self.domain_cache.get(&key) {
            return Ok(domain);
        }
        let domain = self
            .domains
            .get(&key)
            .await?
            .ok_or(MailError::Storage(StorageError::NotFound(
                "mail domain not found",
            )))?;
        self.domain_cache.put(key, domain.clone());
        Ok(domain)
    }

    async fn cached_signer(&self, domain: &str) -> Result<Arc<DomainSigner>, MailError> {
        let key = domain.to_lowercase();
        if let Some(signer) = self.signer_cache.get(&key) {
            return Ok(signer);
        }
        let dkim = self.domains.active_dkim_key(&key).await?;
        let signer = Arc::new(DomainSigner::from_key(&key, dkim.as_ref())?);
        self.signer_cache.put(key, signer.clone());
        Ok(signer)
    }

    pub async fn submit(
        &self,
        ctx: &Context,
        submission: Submission,
    ) -> Result<OutgoingMail, MailError> {
        let mailbox = self
            .mailboxes
            .get(&submission.sender)
            .await?
            .ok_or_else(|| ValidationError::InvalidEmail(submission.sender.clone()))?;
        ctx.require_mailbox_owner(&mailbox)?;

        let domain = self.cached_domain(&mailbox.domain_name).await?;
        let signer = self.cached_signer(&domain.name).await?;

        let in_reply_to = match submission.in_reply_to_mail {
            Some((kind, mail_id)) => Some(
                self.outgoing
                    .message_id_of(kind, mail_id)
                    .await?
                    .ok_or_else(|| ValidationError::UnknownReplyToMail(mail_id.to_string()))?,
            ),
            None => None,
        };

        let compose_ctx = ComposeContext {
            settings: &self.settings,
            domain: &domain,
            mailbox: &mailbox,
            signer: signer.as_ref(),
            in_reply_to,
            system_manager: ctx.system_manager,
        };

        let now = Utc::now();

        if let Some(raw) = submission.raw_message.clone() {
            let mut submission = submission;
            if submission.in_reply_to_mail.is_none() {
                // thread a raw reply back to the internal mail it answers
                if let Some(in_reply_to) = ParsedMail::parse(raw.as_bytes())
                    .ok()
                    .and_then(|p| p.in_reply_to())
                {
                    submission.in_reply_to_mail =
                        self.outgoing.find_by_message_id(&in_reply_to).await?;
                }
            }
            let mail = build_raw_mail(&submission, &compose_ctx, &raw, now)?;
            self.outgoing.create(&mail).await?;
            self.persist_raw_attachments(&mail).await?;
            debug!(mail_id = %mail.id, "outgoing mail composed from raw message");
            self.create_contacts(&mailbox, &mail).await?;
            return Ok(mail);
        }

        validate_attachments(&submission.attachments, &self.settings)?;
        let mut prepared = Vec::with_capacity(submission.attachments.len());
        for upload in &submission.attachments {
            let file = self
                .store
                .save(&upload.filename, &upload.content, true)
                .await?;
            prepared.push(PreparedAttachment {
                file,
                content: upload.content.clone(),
                content_type: guess_content_type(&upload.filename).to_owned(),
                inline: false,
            });
        }

        let mail = build_structured_mail(&submission, &compose_ctx, &mut prepared, now)?;
        let refs: Vec<AttachmentRef> = prepared
            .iter()
            .map(|a| AttachmentRef {
                id: a.file.id,
                mail_kind: MailKind::Outgoing,
                mail_id: mail.id,
                file_name: a.file.file_name.clone(),
                file_url: a.file.file_url.clone(),
                content_type: a.content_type.clone(),
                size: a.file.size,
                inline: a.inline,
            })
            .collect();
        self.outgoing.create(&mail).await?;
        self.attachments.save_refs(&refs).await?;
        debug!(mail_id = %mail.id, "outgoing mail composed");
        self.create_contacts(&mailbox, &mail).await?;
        Ok(mail)
    }

    /// Attachments embedded in a raw submission are lifted out and stored
    /// so the aggregate has the same file references either way. Inline
    /// parts get their `cid:` references replaced with the stored URLs in
    /// the persisted bodies.
    async fn persist_raw_attachments(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let parsed = ParsedMail::parse(mail.message.as_bytes())?;
        let content = parsed.extract_content();
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
                mail_kind: MailKind::Outgoing,
                mail_id: mail.id,
                file_name: file.file_name,
                file_url: file.file_url,
                content_type: attachment.content_type.clone(),
                size: attachment.content.len() as i64,
                inline: attachment.inline,
            });
        }
        self.attachments.save_refs(&refs).await?;

        if !cid_map.is_empty() {
            let mut body_html = mail.body_html.clone().unwrap_or_default();
            let mut body_plain = mail.body_plain.clone().unwrap_or_default();
            rewrite_cid_references(&mut body_html, &mut body_plain, &cid_map);
            self.outgoing
                .update_bodies(mail.id, &body_html, &body_plain)
                .await?;
        }
        Ok(())
    }

    async fn create_contacts(
        &self,
        mailbox: &Mailbox,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        if !mailbox.create_mail_contact {
            return Ok(());
        }
        for recipient in &mail.recipients {
            self.contacts
                .upsert(
                    &mailbox.user,
                    &recipient.email,
                    recipient.display_name.as_deref(),
                )
                .await?;
        }
        Ok(())
    }

    /// Operator retry for a failed transfer: back to `Pending`, out of the
    /// batch, error log cleared.
    pub async fn retry_failed_mail(&self, ctx: &Context, id: Uuid) -> Result<bool, MailError> {
        ctx.require_system_manager()?;
        Ok(self.outgoing.retry_failed(id).await?)
    }
}

/// Start a reply submission from an existing mail: subject gains a `Re: `
/// prefix, recipients come from To (and Cc when `reply_all`).
pub fn reply_submission(mail: &OutgoingMail, reply_all: bool) -> Submission {
    let subject = if mail.subject.starts_with("Re: ") {
        mail.subject.clone()
    } else {
        format!("Re: {}", mail.subject)
    };

    let mut to = Vec::new();
    let mut cc = Vec::new();
    for recipient in &mail.recipients {
        let formatted = utils::format_addr(recipient.display_name.as_deref(), &recipient.email);
        match recipient.kind {
            RecipientKind::To => to.push(formatted),
            RecipientKind::Cc if reply_all => cc.push(formatted),
            _ => {}
        }
    }

    Submission {
        sender: mail.sender.clone(),
        subject,
        to,
        cc,
        in_reply_to_mail: Some((MailKind::Outgoing, mail.id)),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DkimKey, MailboxStatus};
    use aws_lc_rs::{encoding::AsDer, rsa::KeySize, signature::KeyPair};

    fn settings() -> MailSettings {
        let mut settings = MailSettings::from_env();
        settings.max_recipients = 3;
        settings.max_headers = 2;
        settings.max_message_size = 512 * 1024;
        settings.outgoing_max_attachments = 2;
        settings.outgoing_max_attachment_size = 1024;
        settings.outgoing_total_attachments_size = 1536;
        settings.site_url = "https://mail.test".to_owned();
        settings
    }

    fn domain() -> MailDomain {
        MailDomain {
            name: "example.test".to_owned(),
            enabled: true,
            is_verified: true,
            is_root_domain: false,
            dkim_key_size: 2048,
            newsletter_retention: 7,
            outgoing_agent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn mailbox() -> Mailbox {
        Mailbox {
            email: "alice@example.test".to_owned(),
            domain_name: "example.test".to_owned(),
            user: "alice".to_owned(),
            enabled: true,
            incoming: true,
            outgoing: true,
            status: MailboxStatus::Active,
            is_default: true,
            display_name: Some("Alice".to_owned()),
            track_outgoing_mail: false,
            create_mail_contact: false,
            override_display_name: false,
            override_reply_to: false,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    fn signer() -> DomainSigner {
        let keypair = aws_lc_rs::rsa::KeyPair::generate(KeySize::Rsa2048).unwrap();
        let key = DkimKey {
            id: 1,
            domain_name: "example.test".to_owned(),
            selector: "mf1".to_owned(),
            private_key: keypair.as_der().unwrap().as_ref().to_vec(),
            public_key: String::new(),
            key_size: 2048,
            enabled: true,
            created_at: Utc::now(),
        };
        DomainSigner::from_key("example.test", Some(&key)).unwrap()
    }

    fn submission() -> Submission {
        Submission {
            sender: "alice@example.test".to_owned(),
            to: vec!["Bob <bob@peer.test>".to_owned()],
            subject: "Hi".to_owned(),
            body_html: Some("<p>Hi</p>".to_owned()),
            via_api: true,
            ..Default::default()
        }
    }

    fn build(
        submission: &Submission,
        settings: &MailSettings,
        domain: &MailDomain,
        mailbox: &Mailbox,
        signer: &DomainSigner,
    ) -> Result<OutgoingMail, MailError> {
        let ctx = ComposeContext {
            settings,
            domain,
            mailbox,
            signer,
            in_reply_to: None,
            system_manager: false,
        };
        build_structured_mail(submission, &ctx, &mut [], Utc::now())
    }

    #[test]
    fn composed_mail_round_trips_through_the_parser() {
        let (settings, domain, mailbox, signer) = (settings(), domain(), mailbox(), signer());
        let mut submission = submission();
        submission.cc = vec!["carol@peer.test".to_owned()];
        submission.reply_to = Some("replies@example.test".to_owned());
        submission.custom_headers = vec![CustomHeader {
            key: "X-Campaign".to_owned(),
            value: "spring".to_owned(),
        }];

        let mail = build(&submission, &settings, &domain, &mailbox, &signer).unwrap();

        assert_eq!(mail.status, OutgoingStatus::Pending);
        assert_eq!(mail.docstatus, DocStatus::Submitted);
        assert_eq!(mail.folder, OutgoingFolder::Sent);
        assert_eq!(mail.recipients.len(), 2);
        assert!(mail.submitted_at >= mail.created_at);
        assert!(mail.message.starts_with("DKIM-Signature:"));

        let parsed = ParsedMail::parse(mail.message.as_bytes()).unwrap();
        assert_eq!(parsed.subject(), submission.subject);
        assert_eq!(parsed.message_id().unwrap(), mail.message_id);
        assert_eq!(parsed.reply_to().unwrap(), "replies@example.test");
        assert_eq!(
            crate::utils::get_raw_header(&mail.message, "X-FM-OM").unwrap(),
            mail.id.to_string()
        );
        assert_eq!(
            crate::utils::get_raw_header(&mail.message, "X-Campaign").unwrap(),
            "spring"
        );

        let recipients = parsed.recipients();
        assert!(recipients
            .iter()
            .any(|(kind, addr)| *kind == RecipientKind::To && addr.email == "bob@peer.test"));
        assert!(recipients
            .iter()
            .any(|(kind, addr)| *kind == RecipientKind::Cc && addr.email == "carol@peer.test"));
    }

    #[test]
    fn recipient_cap_is_a_hard_boundary() {
        let (settings, domain, mailbox, signer) = (settings(), domain(), mailbox(), signer());

        let mut at_cap = submission();
        at_cap.to = vec![
            "a@peer.test".to_owned(),
            "b@peer.test".to_owned(),
            "c@peer.test".to_owned(),
        ];
        assert!(build(&at_cap, &settings, &domain, &mailbox, &signer).is_ok());

        let mut over_cap = at_cap.clone();
        over_cap.cc = vec!["d@peer.test".to_owned()];
        let err = build(&over_cap, &settings, &domain, &mailbox, &signer).unwrap_err();
        assert!(matches!(
            err,
            MailError::Validation(ValidationError::RecipientLimitExceeded { count: 4, max: 3 })
        ));
    }

    #[test]
    fn duplicate_recipients_are_rejected_case_insensitively() {
        let (settings, domain, mailbox, signer) = (settings(), domain(), mailbox(), signer());
        let mut submission = submission();
        submission.to = vec!["bob@peer.test".to_owned(), "Bob <BOB@peer.test>".to_owned()];
        let err = build(&submission, &settings, &domain, &mailbox, &signer).unwrap_err();
        assert!(matches!(
            err,
            MailError::Validation(ValidationError::DuplicateRecipient { .. })
        ));
    }

    #[test]
    fn internal_header_namespace_is_forbidden() {
        let headers = vec![CustomHeader {
            key: "X-FM-Trace".to_owned(),
            value: "1".to_owned(),
        }];
        assert!(matches!(
            validate_custom_headers(&headers, 5),
            Err(ValidationError::ForbiddenHeader(_))
        ));

        // a missing X- prefix is added rather than rejected
        let headers = vec![CustomHeader {
            key: "Campaign".to_owned(),
            value: "spring".to_owned(),
        }];
        let normalised = validate_custom_headers(&headers, 5).unwrap();
        assert_eq!(normalised[0].key, "X-Campaign");

        let duplicated = vec![
            CustomHeader {
                key: "X-Campaign".to_owned(),
                value: "a".to_owned(),
            },
            CustomHeader {
                key: "x-campaign".to_owned(),
                value: "b".to_owned(),
            },
        ];
        assert!(matches!(
            validate_custom_headers(&duplicated, 5),
            Err(ValidationError::DuplicateHeader(_))
        ));
    }

    #[test]
    fn attachment_caps_are_exact() {
        let settings = settings();

        let at_cap = vec![AttachmentUpload {
            filename: "a.bin".to_owned(),
            content: vec![0u8; 1024],
        }];
        assert!(validate_attachments(&at_cap, &settings).is_ok());

        let over = vec![AttachmentUpload {
            filename: "a.bin".to_owned(),
            content: vec![0u8; 1025],
        }];
        assert!(matches!(
            validate_attachments(&over, &settings),
            Err(ValidationError::AttachmentTooLarge { size: 1025, max: 1024 })
        ));

        let total_over = vec![
            AttachmentUpload {
                filename: "a.bin".to_owned(),
                content: vec![0u8; 1024],
            },
            AttachmentUpload {
                filename: "b.bin".to_owned(),
                content: vec![0u8; 513],
            },
        ];
        assert!(matches!(
            validate_attachments(&total_over, &settings),
            Err(ValidationError::TotalAttachmentsTooLarge { size: 1537, max: 1536 })
        ));
    }

    #[test]
    fn tracking_pixel_is_injected_before_signing() {
        let (settings, domain, signer) = (settings(), domain(), signer());
        let mailbox = Mailbox {
            track_outgoing_mail: true,
            ..mailbox()
        };

        let mail = build(&submission(), &settings, &domain, &mailbox, &signer).unwrap();
        let tracking_id = mail.tracking_id.expect("tracking id assigned");

        let pixel = format!("https://mail.test/api/track/open?id={tracking_id}");
        assert!(mail.body_html.as_deref().unwrap().contains(&pixel));
        assert_eq!(
            mail.body_html.as_deref().unwrap().matches("track/open").count(),
            1
        );

        // the pixel is part of the signed body
        let parsed = ParsedMail::parse(mail.message.as_bytes()).unwrap();
        let content = parsed.extract_content();
        assert!(content.body_html.contains(&pixel));
    }

    #[test]
    fn inline_images_are_rewritten_to_cid() {
        let file = StoredFile {
            id: Uuid::now_v7(),
            file_name: "logo.png".to_owned(),
            file_url: "https://mail.test/files/private/x/logo.png".to_owned(),
            size: 4,
        };
        let mut attachments = vec![PreparedAttachment {
            file: file.clone(),
            content: vec![1, 2, 3, 4],
            content_type: "image/png".to_owned(),
            inline: false,
        }];

        let html = format!("<p><img src=\"{}\"></p>", file.file_url);
        let rewritten = rewrite_inline_images(&html, &mut attachments);

        assert!(rewritten.contains(&format!("cid:{}", file.id)));
        assert!(attachments[0].inline);
    }

    #[test]
    fn disabled_or_unverified_domains_cannot_send() {
        let (settings, mailbox, signer) = (settings(), mailbox(), signer());

        let disabled = MailDomain {
            enabled: false,
            ..domain()
        };
        assert!(matches!(
            build(&submission(), &settings, &disabled, &mailbox, &signer).unwrap_err(),
            MailError::Validation(ValidationError::DomainDisabled(_))
        ));

        let unverified = MailDomain {
            is_verified: false,
            ..domain()
        };
        assert!(matches!(
            build(&submission(), &settings, &unverified, &mailbox, &signer).unwrap_err(),
            MailError::Validation(ValidationError::DomainUnverified(_))
        ));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (domain, mailbox, signer) = (domain(), mailbox(), signer());
        let mut settings = settings();
        settings.max_message_size = 256;

        let err = build(&submission(), &settings, &domain, &mailbox, &signer).unwrap_err();
        assert!(matches!(
            err,
            MailError::Validation(ValidationError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn raw_message_overrides_structured_fields() {
        let (settings, domain, signer) = (settings(), domain(), signer());
        let mailbox = Mailbox {
            override_reply_to: true,
            reply_to: None,
            ..mailbox()
        };

        let raw = "From: Someone Else <other@elsewhere.test>\r\n\
            To: bob@peer.test\r\n\
            Reply-To: hidden@elsewhere.test\r\n\
            Subject: From the wire\r\n\
            Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
            Message-ID: <keepme@elsewhere.test>\r\n\
            \r\n\
            raw body\r\n";

        let ctx = ComposeContext {
            settings: &settings,
            domain: &domain,
            mailbox: &mailbox,
            signer: &signer,
            in_reply_to: None,
            system_manager: false,
        };
        let mut submission = submission();
        submission.raw_message = Some(raw.to_owned());

        let mail = build_raw_mail(&submission, &ctx, raw, Utc::now()).unwrap();

        assert_eq!(mail.subject, "From the wire");
        assert_eq!(mail.message_id, "<keepme@elsewhere.test>");
        // From is reinjected as the authenticated sender
        let from = crate::utils::get_raw_header(&mail.message, "From").unwrap();
        assert!(from.contains("alice@example.test"));
        assert!(!from.contains("other@elsewhere.test"));
        // Reply-To is stripped per the mailbox override
        assert!(crate::utils::get_raw_header(&mail.message, "Reply-To").is_none());
        assert_eq!(mail.reply_to, None);
        assert!(mail.message.starts_with("DKIM-Signature:"));
    }

    #[test]
    fn future_dated_raw_message_is_rejected() {
        let (settings, domain, mailbox, signer) = (settings(), domain(), mailbox(), signer());

        let future = (Utc::now() + chrono::Duration::hours(2)).to_rfc2822();
        let raw = format!(
            "From: alice@example.test\r\nTo: bob@peer.test\r\nSubject: soon\r\nDate: {future}\r\n\r\nhi\r\n"
        );

        let ctx = ComposeContext {
            settings: &settings,
            domain: &domain,
            mailbox: &mailbox,
            signer: &signer,
            in_reply_to: None,
            system_manager: false,
        };
        let mut submission = submission();
        submission.raw_message = Some(raw.clone());

        let err = build_raw_mail(&submission, &ctx, &raw, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            MailError::Validation(ValidationError::FutureDated)
        ));
    }

    #[test]
    fn reply_submission_threads_back() {
        let (settings, domain, mailbox, signer) = (settings(), domain(), mailbox(), signer());
        let mut original = submission();
        original.cc = vec!["carol@peer.test".to_owned()];
        let mail = build(&original, &settings, &domain, &mailbox, &signer).unwrap();

        let reply = reply_submission(&mail, false);
        assert_eq!(reply.subject, "Re: Hi");
        assert_eq!(reply.to, vec!["Bob <bob@peer.test>".to_owned()]);
        assert!(reply.cc.is_empty());
        assert_eq!(reply.in_reply_to_mail, Some((MailKind::Outgoing, mail.id)));

        let reply_all = reply_submission(&mail, true);
        assert_eq!(reply_all.cc, vec!["carol@peer.test".to_owned()]);
    }
}
