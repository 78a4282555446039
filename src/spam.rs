use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::MailSettings;
use crate::error::{MailError, TransientError, ValidationError};
use crate::parser::ParsedMail;

/// How much of a message SpamAssassin sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanningMode {
    ExcludeAttachments,
    IncludeAttachments,
    /// Scan body-only first; rescan with attachments only when the first
    /// score crosses the threshold.
    Hybrid { threshold: f64 },
}

impl ScanningMode {
    pub fn parse(raw: &str, hybrid_threshold: f64) -> Result<Self, ValidationError> {
        match raw {
            "Exclude Attachments" => Ok(ScanningMode::ExcludeAttachments),
            "Include Attachments" => Ok(ScanningMode::IncludeAttachments),
            "Hybrid Approach" => Ok(ScanningMode::Hybrid {
                threshold: hybrid_threshold,
            }),
            other => Err(ValidationError::InvalidScanningMode(other.to_owned())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanningMode::ExcludeAttachments => "Exclude Attachments",
            ScanningMode::IncludeAttachments => "Include Attachments",
            ScanningMode::Hybrid { .. } => "Hybrid Approach",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MailDirection {
    Inbound,
    Outbound,
}

/// Outcome of one scan: the spamd-processed message and the score pulled
/// from its X-Spam-Status header.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub score: f64,
    pub headers: Vec<(String, String)>,
    pub response: String,
}

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"X-Spam-Status:.*?score=(-?[\d.]+)").unwrap())
}

/// Score inside the X-Spam-Status header of a processed message, 0 when
/// the header is missing.
pub fn extract_spam_score(response: &str) -> f64 {
    score_re()
        .captures(response)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0.0)
}

/// All X-Spam-* headers of a processed message.
pub fn extract_spam_headers(response: &str) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for line in response.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.starts_with("X-Spam-") {
                headers.push((key.to_owned(), value.trim().to_owned()));
            }
        }
    }
    headers
}

/// Strip attachment parts before scanning: keep the top-level headers and
/// the text bodies only.
pub fn remove_attachments(message: &str) -> Result<String, MailError> {
    let parsed = ParsedMail::parse(message.as_bytes())?;
    let content = parsed.extract_content();

    let end = message.find("\r\n\r\n").map(|p| p + 4).or_else(|| {
        message.find("\n\n").map(|p| p + 2)
    });
    let headers = match end {
        Some(end) => &message[..end],
        None => message,
    };

    let mut stripped = String::with_capacity(headers.len() + content.body_plain.len());
    stripped.push_str(headers);
    if !content.body_plain.is_empty() {
        stripped.push_str(&content.body_plain);
    } else {
        stripped.push_str(&content.body_html);
    }
    Ok(stripped)
}

/// Talks the SPAMC protocol to a spamd instance.
#[derive(Clone)]
pub struct SpamChecker {
    host: String,
    port: u16,
    enabled: bool,
    mode: ScanningMode,
    max_score_inbound: f64,
    max_score_outbound: f64,
}

impl SpamChecker {
    pub fn new(settings: &MailSettings) -> Self {
        Self {
            host: settings.spamd_host.clone(),
            port: settings.spamd_port,
            enabled: settings.enable_spam_detection,
            mode: settings.scanning_mode,
            max_score_inbound: settings.max_spam_score_for_inbound,
            max_score_outbound: settings.max_spam_score_for_outbound,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> ScanningMode {
        self.mode
    }

    async fn process(&self, message: &str) -> Result<String, MailError> {
        let address = format!("{}:{}", self.host, self.port);
        let connect = TcpStream::connect(&address);
        let mut stream = tokio::time::timeout(Duration::from_secs(5), connect)
            .await
            .map_err(|_| {
                MailError::Transient(TransientError::SpamdUnavailable(format!(
                    "connect timeout to {address}"
                )))
            })?
            .map_err(|e| MailError::Transient(TransientError::SpamdUnavailable(e.to_string())))?;

        let body = message.as_bytes();
        let request = format!("PROCESS SPAMC/1.5\r\nContent-length: {}\r\n\r\n", body.len());

        let spamd_err =
            |e: std::io::Error| MailError::Transient(TransientError::SpamdUnavailable(e.to_string()));

        stream.write_all(request.as_bytes()).await.map_err(spamd_err)?;
        stream.write_all(body).await.map_err(spamd_err)?;
        stream.shutdown().await.map_err(spamd_err)?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.map_err(spamd_err)?;
        let response = String::from_utf8_lossy(&response).into_owned();

        // drop the SPAMD/x.y response status line and protocol headers
        let payload = response
            .split_once("\r\n\r\n")
            .map(|(_, rest)| rest.to_owned())
            .unwrap_or(response);
        Ok(payload)
    }

    /// Run the configured scanning mode and return the processed message
    /// with its score.
    pub async fn scan(&self, message: &str) -> Result<ScanOutcome, MailError> {
        if !self.enabled {
            return Err(ValidationError::InvalidScanningMode(
                "spam detection is disabled".to_owned(),
            )
            .into());
        }

        let response = match self.mode {
            ScanningMode::IncludeAttachments => self.process(message).await?,
            ScanningMode::ExcludeAttachments => {
                let stripped = remove_attachments(message)?;
                self.process(&stripped).await?
            }
            ScanningMode::Hybrid { threshold } => {
                let stripped = remove_attachments(message)?;
                let initial = self.process(&stripped).await?;
                let score = extract_spam_score(&initial);
                if score < threshold {
                    initial
                } else {
                    debug!(score, threshold, "hybrid scan escalating to full message");
                    self.process(message).await?
                }
            }
        };

        Ok(ScanOutcome {
            score: extract_spam_score(&response),
            headers: extract_spam_headers(&response),
            response,
        })
    }

    pub async fn score(&self, message: &str) -> Result<f64, MailError> {
        Ok(self.scan(message).await?.score)
    }

    pub async fn is_spam(
        &self,
        message: &str,
        direction: MailDirection,
    ) -> Result<bool, MailError> {
        let max = match direction {
            MailDirection::Inbound => self.max_score_inbound,
            MailDirection::Outbound => self.max_score_outbound,
        };
        Ok(self.score(message).await? > max)
    }

    pub fn threshold(&self, direction: MailDirection) -> f64 {
        match direction {
            MailDirection::Inbound => self.max_score_inbound,
            MailDirection::Outbound => self.max_score_outbound,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_scanning_modes() {
        assert_eq!(
            ScanningMode::parse("Exclude Attachments", 3.0).unwrap(),
            ScanningMode::ExcludeAttachments
        );
        assert_eq!(
            ScanningMode::parse("Include Attachments", 3.0).unwrap(),
            ScanningMode::IncludeAttachments
        );
        assert_eq!(
            ScanningMode::parse("Hybrid Approach", 4.5).unwrap(),
            ScanningMode::Hybrid { threshold: 4.5 }
        );
        assert!(matches!(
            ScanningMode::parse("Whatever", 3.0),
            Err(ValidationError::InvalidScanningMode(_))
        ));
    }

    #[test]
    fn score_extraction() {
        let response = "X-Spam-Checker-Version: SpamAssassin 4.0\r\n\
            X-Spam-Status: Yes, score=7.2 required=5.0 tests=BAYES_99\r\n\
            \r\nbody";
        assert_eq!(extract_spam_score(response), 7.2);
        assert_eq!(extract_spam_score("no header here"), 0.0);

        let negative = "X-Spam-Status: No, score=-1.9 required=5.0\r\n\r\n";
        assert_eq!(extract_spam_score(negative), -1.9);
    }

    #[test]
    fn spam_header_extraction_stops_at_body() {
        let response = "X-Spam-Status: Yes, score=7.2\r\n\
            X-Spam-Level: *******\r\n\
            Subject: hi\r\n\
            \r\n\
            X-Spam-Status: this is body text, not a header\r\n";
        let headers = extract_spam_headers(response);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "X-Spam-Status");
        assert_eq!(headers[1].0, "X-Spam-Level");
    }

    #[test]
    fn attachment_removal_keeps_headers_and_text() {
        let raw = "From: a@b.test\r\n\
            To: c@d.test\r\n\
            Subject: pics\r\n\
            Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
            \r\n\
            --outer\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            short text body\r\n\
            --outer\r\n\
            Content-Type: application/zip\r\n\
            Content-Disposition: attachment; filename=\"huge.zip\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            UEsDBA==\r\n\
            --outer--\r\n";

        let stripped = remove_attachments(raw).unwrap();
        assert!(stripped.contains("Subject: pics"));
        assert!(stripped.contains("short text body"));
        assert!(!stripped.contains("UEsDBA=="));
    }
}
