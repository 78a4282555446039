mod blacklist;
mod contact;
mod domain;
mod incoming;
mod mailbox;
mod outgoing;
mod spam_log;
mod sync_history;

pub use blacklist::*;
pub use contact::*;
pub use domain::*;
pub use incoming::*;
pub use mailbox::*;
pub use outgoing::*;
pub use spam_log::*;
pub use sync_history::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    Internal(String),
    #[error("AWS cryptographic error {0}")]
    AwsCrypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("AWS cryptographic key rejected {0}")]
    WrongCryptKey(#[from] aws_lc_rs::error::KeyRejected),
    #[error("mail authentication error {0}")]
    MailAuth(#[from] mail_auth::Error),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("invalid utf8")]
    FromUtf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}

/// Submission lifecycle of a document: draft, submitted, cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum DocStatus {
    Draft = 0,
    Submitted = 1,
    Cancelled = 2,
}

/// Which aggregate a threading pointer or attachment refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "mail_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MailKind {
    Incoming,
    Outgoing,
}
