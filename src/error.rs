use thiserror::Error;

use crate::models;

/// Errors surfaced to a submitter before anything is persisted.
///
/// Each variant corresponds to a rejected submission or pull request and maps
/// to a 4xx response at the API boundary.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("domain {0} is disabled")]
    DomainDisabled(String),
    #[error("domain {0} is not verified")]
    DomainUnverified(String),
    #[error("mailbox {0} is disabled")]
    MailboxDisabled(String),
    #[error("mailbox {0} is not active")]
    MailboxInactive(String),
    #[error("mailbox {0} is not allowed for outgoing mail")]
    MailboxNotOutgoing(String),
    #[error("mailbox {0} is not allowed for incoming mail")]
    MailboxNotIncoming(String),
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("recipient limit exceeded ({count}), maximum {max} recipient(s) allowed")]
    RecipientLimitExceeded { count: usize, max: usize },
    #[error("duplicate {kind} recipient {email}")]
    DuplicateRecipient { kind: &'static str, email: String },
    #[error("custom header limit exceeded ({count}), maximum {max} header(s) allowed")]
    HeaderLimitExceeded { count: usize, max: usize },
    #[error("custom header {0} is not allowed")]
    ForbiddenHeader(String),
    #[error("duplicate custom header {0}")]
    DuplicateHeader(String),
    #[error("attachment limit exceeded ({count}), maximum {max} attachment(s) allowed")]
    AttachmentLimitExceeded { count: usize, max: usize },
    #[error("attachment size limit exceeded ({size} bytes), maximum {max} bytes allowed")]
    AttachmentTooLarge { size: usize, max: usize },
    #[error("attachments size limit exceeded ({size} bytes), maximum {max} bytes allowed")]
    TotalAttachmentsTooLarge { size: usize, max: usize },
    #[error("message size limit exceeded ({size} bytes), maximum {max} bytes allowed")]
    MessageTooLarge { size: usize, max: usize },
    #[error("future date is not allowed")]
    FutureDated,
    #[error("the Date header is missing or unparseable")]
    InvalidHeaderDate,
    #[error("invalid datetime: {0}")]
    InvalidDateFormat(String),
    #[error("invalid scanning mode: {0}")]
    InvalidScanningMode(String),
    #[error("cannot fetch more than {0} mails at a time")]
    SyncLimitExceeded(i64),
    #[error("reply-to mail {0} does not exist")]
    UnknownReplyToMail(String),
    #[error("alias {0} may not contain its own address")]
    SelfReferentialAlias(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("user {user} does not own mailbox {mailbox}")]
    NotMailboxOwner { user: String, mailbox: String },
    #[error("user {0} is not the postmaster")]
    NotPostmaster(String),
    #[error("user {0} is not a system manager")]
    NotSystemManager(String),
}

/// Transient infrastructure failures. Workers retry these locally; the API
/// surfaces them as 503.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),
    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),
    #[error("spamd unavailable: {0}")]
    SpamdUnavailable(String),
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error("no enabled DKIM key for domain {0}")]
    DkimKeyMissing(String),
    #[error("no outgoing agent available")]
    NoOutgoingAgent,
    #[error("alias {0} is disabled")]
    AliasDisabled(String),
    #[error("sync history already exists for ({source_system}, {user}, {mailbox})")]
    DuplicateSyncHistory {
        source_system: String,
        user: String,
        mailbox: String,
    },
    #[error("corrupt message: {0}")]
    CorruptMessage(String),
    #[error(transparent)]
    Storage(#[from] models::Error),
}

impl From<sqlx::Error> for MailError {
    fn from(err: sqlx::Error) -> Self {
        MailError::Storage(err.into())
    }
}

impl From<lapin::Error> for MailError {
    fn from(err: lapin::Error) -> Self {
        MailError::Transient(TransientError::BrokerUnavailable(err.to_string()))
    }
}

impl MailError {
    /// Whether a worker should retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Transient(_))
    }
}
