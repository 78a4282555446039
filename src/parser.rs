use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, MimeHeaders};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{MailError, ValidationError};
use crate::models::{AuthenticationResults, RecipientKind};

#[derive(Debug, Clone, PartialEq)]
pub struct AddrSpec {
    pub display_name: Option<String>,
    pub email: String,
}

/// An attachment lifted out of a parsed message, before it lands in the
/// document store.
#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
    pub content_id: Option<String>,
    pub inline: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ExtractedContent {
    pub body_html: String,
    pub body_plain: String,
    pub attachments: Vec<RawAttachment>,
}

fn received_ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[((?:\d{1,3}\.){3}\d{1,3}|[0-9a-fA-F:]+)\]").unwrap())
}

fn bare_ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap())
}

fn received_host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"from\s+([^\s()]+)").unwrap())
}

/// Read-only view over one parsed RFC 5322 message.
pub struct ParsedMail<'a> {
    msg: Message<'a>,
}

impl<'a> ParsedMail<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, MailError> {
        let msg = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MailError::CorruptMessage("unparseable MIME structure".to_owned()))?;
        Ok(Self { msg })
    }

    pub fn size(&self) -> usize {
        self.msg.raw_message.len()
    }

    pub fn raw(&self) -> &[u8] {
        self.msg.raw_message.as_ref()
    }

    /// RFC 2047-decoded subject.
    pub fn subject(&self) -> String {
        self.msg.subject().unwrap_or_default().to_owned()
    }

    pub fn sender(&self) -> Option<AddrSpec> {
        let addr = self.msg.from()?.first()?;
        Some(AddrSpec {
            display_name: addr.name().map(|n| n.to_owned()),
            email: addr.address()?.to_lowercase(),
        })
    }

    pub fn reply_to(&self) -> Option<String> {
        let addr = self.msg.reply_to()?.first()?;
        Some(crate::utils::format_addr(addr.name(), addr.address()?))
    }

    /// Message-ID in canonical angle-bracketed form.
    pub fn message_id(&self) -> Option<String> {
        self.msg.message_id().map(|id| format!("<{id}>"))
    }

    pub fn in_reply_to(&self) -> Option<String> {
        let bracketed = |id: &str| format!("<{}>", id.trim_matches(|c| c == '<' || c == '>'));
        match self.msg.in_reply_to() {
            HeaderValue::Text(id) => Some(bracketed(id.as_ref())),
            HeaderValue::TextList(ids) => ids.first().map(|id| bracketed(id.as_ref())),
            _ => None,
        }
    }

    /// Origin date, normalised to UTC.
    pub fn date(&self) -> Result<DateTime<Utc>, ValidationError> {
        let date = self.msg.date().ok_or(ValidationError::InvalidHeaderDate)?;
        DateTime::from_timestamp(date.to_timestamp(), 0).ok_or(ValidationError::InvalidHeaderDate)
    }

    pub fn delivered_to(&self) -> Option<String> {
        let raw = String::from_utf8_lossy(self.msg.raw_message.as_ref());
        crate::utils::get_raw_header(&raw, "Delivered-To").map(|v| v.trim().to_lowercase())
    }

    pub fn recipients(&self) -> Vec<(RecipientKind, AddrSpec)> {
        let mut out = Vec::new();
        let groups = [
            (RecipientKind::To, self.msg.to()),
            (RecipientKind::Cc, self.msg.cc()),
            (RecipientKind::Bcc, self.msg.bcc()),
        ];
        for (kind, addresses) in groups {
            let Some(addresses) = addresses else { continue };
            for addr in addresses.iter() {
                if let Some(email) = addr.address() {
                    out.push((
                        kind,
                        AddrSpec {
                            display_name: addr.name().map(|n| n.to_owned()),
                            email: email.to_lowercase(),
                        },
                    ));
                }
            }
        }
        out
    }

    /// Source IP and host from the topmost Received header: the IP inside
    /// `[...]`, the host after `from `.
    pub fn source_ip_and_host(&self) -> (Option<String>, Option<String>) {
        let raw = String::from_utf8_lossy(self.msg.raw_message.as_ref());
        let Some(received) = crate::utils::get_raw_header(&raw, "Received") else {
            return (None, None);
        };

        let ip = received_ip_re()
            .captures(&received)
            .map(|c| c[1].to_owned())
            .or_else(|| {
                bare_ipv4_re()
                    .find(&received)
                    .map(|m| m.as_str().to_owned())
            });
        let host = received_host_re()
            .captures(&received)
            .map(|c| c[1].to_owned());

        (ip, host)
    }

    /// Fold every Authentication-Results header into spf/dkim/dmarc
    /// verdicts. A single header with `;`-separated clauses and multiple
    /// headers are both accepted; absent checks read as failed with
    /// "Header not found.".
    pub fn authentication_results(&self) -> AuthenticationResults {
        let mut results = AuthenticationResults {
            spf_description: "Header not found.".to_owned(),
            dkim_description: "Header not found.".to_owned(),
            dmarc_description: "Header not found.".to_owned(),
            ..Default::default()
        };

        let mut headers: Vec<String> = Vec::new();
        if let Some(root) = self.msg.parts.first() {
            for header in &root.headers {
                if header
                    .name
                    .as_str()
                    .eq_ignore_ascii_case("Authentication-Results")
                {
                    if let Some(text) = header.value.as_text() {
                        headers.push(text.to_owned());
                    }
                }
            }
        }

        if headers.len() == 1 {
            headers = headers[0].split(';').map(|s| s.to_owned()).collect();
        }

        for header in &headers {
            let clean = header.replace(['\n', '\t'], " ").trim().to_owned();
            let lower = clean.to_lowercase();
            for check in ["spf", "dkim", "dmarc"] {
                if !lower.contains(&format!("{check}=")) {
                    continue;
                }
                let pass = lower.contains(&format!("{check}=pass"));
                match check {
                    "spf" => {
                        results.spf_pass = pass;
                        results.spf_description = clean.clone();
                    }
                    "dkim" => {
                        results.dkim_pass = pass;
                        results.dkim_description = clean.clone();
                    }
                    _ => {
                        results.dmarc_pass = pass;
                        results.dmarc_description = clean.clone();
                    }
                }
                break;
            }
        }

        results
    }

    /// Concatenate the text bodies and collect attachment parts. Inline
    /// parts keep their Content-ID so the stored file URL can replace
    /// `cid:` references afterwards.
    pub fn extract_content(&self) -> ExtractedContent {
        let mut content = ExtractedContent::default();

        for i in 0..self.msg.html_body_count() {
            if let Some(html) = self.msg.body_html(i) {
                content.body_html.push_str(&html);
            }
        }
        for i in 0..self.msg.text_body_count() {
            if let Some(text) = self.msg.body_text(i) {
                content.body_plain.push_str(&text);
            }
        }

        for part in self.msg.attachments() {
            let content_type = match part.content_type() {
                Some(ct) => match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_owned(),
                },
                None => "application/octet-stream".to_owned(),
            };
            let inline = part
                .content_disposition()
                .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("inline"));
            let content_id = part
                .content_id()
                .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_owned());

            content.attachments.push(RawAttachment {
                file_name: part
                    .attachment_name()
                    .unwrap_or("attachment")
                    .to_owned(),
                content_type,
                content: part.contents().to_vec(),
                content_id,
                inline,
            });
        }

        content
    }
}

/// Replace `cid:<id>` references with the stored file URLs in both bodies.
pub fn rewrite_cid_references(
    body_html: &mut String,
    body_plain: &mut String,
    cid_to_url: &[(String, String)],
) {
    for (cid, url) in cid_to_url {
        let needle = format!("cid:{cid}");
        *body_html = body_html.replace(&needle, url);
        *body_plain = body_plain.replace(&needle, url);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIMPLE: &str = "From: Alice Example <alice@example.test>\r\n\
        To: Bob <bob@peer.test>, carol@peer.test\r\n\
        Cc: dave@peer.test\r\n\
        Reply-To: replies@example.test\r\n\
        Subject: =?utf-8?q?Hello_=F0=9F=91=8B?=\r\n\
        Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
        Message-ID: <abc123@example.test>\r\n\
        In-Reply-To: <parent@example.test>\r\n\
        Delivered-To: bob@peer.test\r\n\
        Received: from out.example.test (out.example.test [203.0.113.9]) by mx.peer.test\r\n\
        Authentication-Results: mx.peer.test; spf=pass (sender ip); dkim=fail reason=bad; dmarc=pass\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Hi there\r\n";

    #[test]
    fn extracts_envelope_headers() {
        let mail = ParsedMail::parse(SIMPLE.as_bytes()).unwrap();

        assert_eq!(mail.subject(), "Hello 👋");
        assert_eq!(
            mail.sender().unwrap(),
            AddrSpec {
                display_name: Some("Alice Example".to_owned()),
                email: "alice@example.test".to_owned()
            }
        );
        assert_eq!(mail.message_id().unwrap(), "<abc123@example.test>");
        assert_eq!(mail.in_reply_to().unwrap(), "<parent@example.test>");
        assert_eq!(mail.delivered_to().unwrap(), "bob@peer.test");
        assert_eq!(mail.reply_to().unwrap(), "replies@example.test");

        let date = mail.date().unwrap();
        assert_eq!(date.to_rfc3339(), "2025-01-06T10:30:00+00:00");
    }

    #[test]
    fn recipients_grouped_by_header() {
        let mail = ParsedMail::parse(SIMPLE.as_bytes()).unwrap();
        let recipients = mail.recipients();
        assert_eq!(recipients.len(), 4);
        assert_eq!(recipients[0].0, RecipientKind::To);
        assert_eq!(recipients[0].1.email, "bob@peer.test");
        assert_eq!(recipients[0].1.display_name.as_deref(), Some("Bob"));
        assert_eq!(recipients[1].1.email, "carol@peer.test");
        assert_eq!(recipients[2].0, RecipientKind::Cc);
        assert_eq!(recipients[2].1.email, "dave@peer.test");
    }

    #[test]
    fn received_header_yields_ip_and_host() {
        let mail = ParsedMail::parse(SIMPLE.as_bytes()).unwrap();
        let (ip, host) = mail.source_ip_and_host();
        assert_eq!(ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(host.as_deref(), Some("out.example.test"));
    }

    #[test]
    fn auth_results_single_header_with_clauses() {
        let mail = ParsedMail::parse(SIMPLE.as_bytes()).unwrap();
        let auth = mail.authentication_results();
        assert!(auth.spf_pass);
        assert!(!auth.dkim_pass);
        assert!(auth.dmarc_pass);
        assert!(auth.spf_description.contains("spf=pass"));
        assert!(auth.dkim_description.contains("dkim=fail"));
    }

    #[test]
    fn auth_results_default_when_absent() {
        let raw = "From: a@b.test\r\nTo: c@d.test\r\nSubject: x\r\n\
            Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\r\nbody\r\n";
        let mail = ParsedMail::parse(raw.as_bytes()).unwrap();
        let auth = mail.authentication_results();
        assert!(!auth.spf_pass && !auth.dkim_pass && !auth.dmarc_pass);
        assert_eq!(auth.spf_description, "Header not found.");
    }

    #[test]
    fn missing_date_is_an_error() {
        let raw = "From: a@b.test\r\nTo: c@d.test\r\nSubject: x\r\n\r\nbody\r\n";
        let mail = ParsedMail::parse(raw.as_bytes()).unwrap();
        assert_eq!(mail.date(), Err(ValidationError::InvalidHeaderDate));
    }

    #[test]
    fn multipart_bodies_and_inline_attachment() {
        let raw = "From: a@b.test\r\n\
            To: c@d.test\r\n\
            Subject: pics\r\n\
            Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
            \r\n\
            --outer\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>see <img src=\"cid:logo1\"></p>\r\n\
            --outer\r\n\
            Content-Type: image/png\r\n\
            Content-ID: <logo1>\r\n\
            Content-Disposition: inline; filename=\"logo.png\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            iVBORw0KGgo=\r\n\
            --outer\r\n\
            Content-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            JVBERi0=\r\n\
            --outer--\r\n";

        let mail = ParsedMail::parse(raw.as_bytes()).unwrap();
        let content = mail.extract_content();

        assert!(content.body_html.contains("cid:logo1"));
        assert_eq!(content.attachments.len(), 2);

        let inline = &content.attachments[0];
        assert_eq!(inline.file_name, "logo.png");
        assert_eq!(inline.content_type, "image/png");
        assert!(inline.inline);
        assert_eq!(inline.content_id.as_deref(), Some("logo1"));

        let attached = &content.attachments[1];
        assert_eq!(attached.file_name, "doc.pdf");
        assert!(!attached.inline);

        let mut html = content.body_html.clone();
        let mut plain = content.body_plain.clone();
        rewrite_cid_references(
            &mut html,
            &mut plain,
            &[("logo1".to_owned(), "http://files/logo.png".to_owned())],
        );
        assert!(html.contains("http://files/logo.png"));
        assert!(!html.contains("cid:logo1"));
    }
}
