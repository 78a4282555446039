use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use uuid::Uuid;

use crate::error::ValidationError;

/// Split a `Name <addr>` (or bare `addr`) string into display name and
/// addr-spec, validating the addr-spec.
pub fn parse_addr(raw: &str) -> Result<(Option<String>, String), ValidationError> {
    let raw = raw.trim();
    let (name, addr) = match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            let name = raw[..start].trim().trim_matches('"').trim();
            let addr = raw[start + 1..end].trim();
            let name = (!name.is_empty()).then(|| name.to_owned());
            (name, addr)
        }
        _ => (None, raw),
    };

    if !EmailAddress::is_valid(addr) {
        return Err(ValidationError::InvalidEmail(raw.to_owned()));
    }

    Ok((name, addr.to_lowercase()))
}

pub fn format_addr(display_name: Option<&str>, email: &str) -> String {
    match display_name {
        Some(name) if !name.is_empty() => format!("{name} <{email}>"),
        _ => email.to_owned(),
    }
}

/// Domain part of a validated address.
pub fn domain_of(email: &str) -> &str {
    email.rsplit('@').next().unwrap_or(email)
}

/// Globally unique RFC 5322 Message-ID for the given domain.
pub fn make_msgid(domain: &str) -> String {
    format!("<{}@{domain}>", Uuid::now_v7().simple())
}

pub fn diff_seconds(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

pub fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 78)
}

/// Byte offset of the first blank line separating headers from body.
fn header_end(raw: &str) -> usize {
    if let Some(pos) = raw.find("\r\n\r\n") {
        pos + 2
    } else if let Some(pos) = raw.find("\n\n") {
        pos + 1
    } else {
        raw.len()
    }
}

/// Remove every occurrence of a header (including folded continuation
/// lines) from a raw RFC 5322 message.
pub fn remove_raw_header(raw: &str, name: &str) -> String {
    let end = header_end(raw);
    let (headers, body) = raw.split_at(end);

    let mut kept = String::with_capacity(raw.len());
    let mut skipping = false;
    for line in headers.split_inclusive('\n') {
        if line.starts_with(' ') || line.starts_with('\t') {
            if !skipping {
                kept.push_str(line);
            }
            continue;
        }
        skipping = line
            .split(':')
            .next()
            .is_some_and(|key| key.trim().eq_ignore_ascii_case(name));
        if !skipping {
            kept.push_str(line);
        }
    }

    kept.push_str(body);
    kept
}

/// Replace (or insert) a header at the top of a raw RFC 5322 message.
pub fn set_raw_header(raw: &str, name: &str, value: &str) -> String {
    let stripped = remove_raw_header(raw, name);
    format!("{name}: {value}\r\n{stripped}")
}

pub fn get_raw_header(raw: &str, name: &str) -> Option<String> {
    let end = header_end(raw);
    let mut value: Option<String> = None;
    for line in raw[..end].split_inclusive('\n') {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(v) = value.as_mut() {
                v.push(' ');
                v.push_str(line.trim());
            }
            continue;
        }
        if value.is_some() {
            break;
        }
        if let Some((key, rest)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                value = Some(rest.trim().to_owned());
            }
        }
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_addr_variants() {
        assert_eq!(
            parse_addr("Alice Example <Alice@Example.Test>").unwrap(),
            (Some("Alice Example".to_owned()), "alice@example.test".to_owned())
        );
        assert_eq!(
            parse_addr("bob@peer.test").unwrap(),
            (None, "bob@peer.test".to_owned())
        );
        assert_eq!(
            parse_addr("\"Eve\" <eve@example.test>").unwrap(),
            (Some("Eve".to_owned()), "eve@example.test".to_owned())
        );
        assert!(parse_addr("not-an-address").is_err());
        assert!(parse_addr("Broken <not@@addr>").is_err());
    }

    #[test]
    fn raw_header_editing() {
        let raw = "Subject: Hi\r\nReply-To: a@b.test,\r\n\tc@d.test\r\nFrom: x@y.test\r\n\r\nBody\r\n";

        let stripped = remove_raw_header(raw, "reply-to");
        assert!(!stripped.contains("Reply-To"));
        assert!(!stripped.contains("c@d.test"));
        assert!(stripped.contains("Subject: Hi"));
        assert!(stripped.contains("Body"));

        let replaced = set_raw_header(raw, "From", "Postmaster <post@y.test>");
        assert!(replaced.starts_with("From: Postmaster <post@y.test>\r\n"));
        assert_eq!(replaced.matches("From:").count(), 1);
    }

    #[test]
    fn raw_header_lookup_unfolds() {
        let raw = "Subject: Hello\r\n world\r\nFrom: x@y.test\r\n\r\nBody";
        assert_eq!(get_raw_header(raw, "subject").unwrap(), "Hello world");
        assert_eq!(get_raw_header(raw, "from").unwrap(), "x@y.test");
        assert!(get_raw_header(raw, "body").is_none());
    }

    #[test]
    fn msgid_carries_domain() {
        let id = make_msgid("example.test");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.test>"));
    }
}
