use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};

use crate::error::MailError;
use crate::models::DkimKey;

/// The header set bound by every signature. Order matters: it is what the
/// agents and receivers verify against.
const SIGNED_HEADERS: [&str; 8] = [
    "To",
    "Cc",
    "From",
    "Date",
    "Subject",
    "Reply-To",
    "Message-ID",
    "In-Reply-To",
];

/// Signs outbound messages for one domain with its active key.
#[derive(Debug)]
pub struct DomainSigner {
    domain: String,
    selector: String,
    pkcs8_der: Vec<u8>,
}

impl DomainSigner {
    /// Build a signer from a stored key record. `None` keys surface as
    /// [`MailError::DkimKeyMissing`] so callers don't have to special-case
    /// the lookup miss.
    pub fn from_key(domain: &str, key: Option<&DkimKey>) -> Result<Self, MailError> {
        let key = key.ok_or_else(|| MailError::DkimKeyMissing(domain.to_owned()))?;
        // fail early on undecodable key material
        RsaKey::<Sha256>::from_pkcs8_der(&key.private_key)
            .map_err(|e| MailError::Storage(e.into()))?;
        Ok(Self {
            domain: domain.to_owned(),
            selector: key.selector.clone(),
            pkcs8_der: key.private_key.clone(),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Sign a complete RFC 5322 message and return the collapsed
    /// single-line `DKIM-Signature: ...` header.
    pub fn dkim_header(&self, raw_message: &[u8]) -> Result<String, MailError> {
        let sign_key = RsaKey::<Sha256>::from_pkcs8_der(&self.pkcs8_der)
            .map_err(|e| MailError::Storage(e.into()))?;
        let signer = DkimSigner::from_key(sign_key)
            .domain(&self.domain)
            .selector(&self.selector)
            .headers(SIGNED_HEADERS);

        let signature = signer
            .sign(raw_message)
            .map_err(|e| MailError::Storage(e.into()))?;

        let header = signature.to_header();
        Ok(header
            .replace("\r\n", " ")
            .replace(['\r', '\n', '\t'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Prepend the signature header to the wire message.
    pub fn sign(&self, raw_message: &str) -> Result<String, MailError> {
        let header = self.dkim_header(raw_message.as_bytes())?;
        Ok(format!("{header}\r\n{raw_message}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aws_lc_rs::{encoding::AsDer, rsa::KeySize, signature::KeyPair};
    use chrono::Utc;

    fn generated_key(domain: &str) -> DkimKey {
        let keypair = aws_lc_rs::rsa::KeyPair::generate(KeySize::Rsa2048).unwrap();
        DkimKey {
            id: 1,
            domain_name: domain.to_owned(),
            selector: "mf1".to_owned(),
            private_key: keypair.as_der().unwrap().as_ref().to_vec(),
            public_key: String::new(),
            key_size: 2048,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn missing_key_is_reported() {
        let err = DomainSigner::from_key("example.test", None).unwrap_err();
        assert!(matches!(err, MailError::DkimKeyMissing(d) if d == "example.test"));
    }

    #[test]
    fn signature_is_single_line_and_prepended() {
        let key = generated_key("example.test");
        let signer = DomainSigner::from_key("example.test", Some(&key)).unwrap();

        let message = "From: alice@example.test\r\n\
            To: bob@peer.test\r\n\
            Subject: Hi\r\n\
            Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
            Message-ID: <abc@example.test>\r\n\
            \r\n\
            Hello\r\n";

        let signed = signer.sign(message).unwrap();
        let first_line = signed.lines().next().unwrap();
        assert!(first_line.starts_with("DKIM-Signature:"));
        assert!(first_line.contains("d=example.test"));
        assert!(first_line.contains("s=mf1"));
        assert!(signed.ends_with(message));

        // the collapsed header holds the whole signature on one physical line
        let header = signer.dkim_header(message.as_bytes()).unwrap();
        assert!(!header.contains('\n'));
        assert!(!header.contains('\r'));
    }
}
