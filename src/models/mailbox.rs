use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::ValidationError;
use crate::models::Error;
use crate::utils::domain_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "mailbox_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    Active,
    Disabled,
}

/// A user-owned address under a verified domain.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Mailbox {
    pub email: String,
    pub domain_name: String,
    pub user: String,
    pub enabled: bool,
    pub incoming: bool,
    pub outgoing: bool,
    pub status: MailboxStatus,
    pub is_default: bool,
    pub display_name: Option<String>,
    pub track_outgoing_mail: bool,
    pub create_mail_contact: bool,
    pub override_display_name: bool,
    pub override_reply_to: bool,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Mailbox {
    /// A mailbox address must live under its own domain.
    pub fn validate_domain_part(&self) -> Result<(), ValidationError> {
        if domain_of(&self.email) == self.domain_name {
            Ok(())
        } else {
            Err(ValidationError::InvalidEmail(self.email.clone()))
        }
    }

    pub fn check_outgoing(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Err(ValidationError::MailboxDisabled(self.email.clone()));
        }
        if self.status != MailboxStatus::Active {
            return Err(ValidationError::MailboxInactive(self.email.clone()));
        }
        if !self.outgoing {
            return Err(ValidationError::MailboxNotOutgoing(self.email.clone()));
        }
        Ok(())
    }

    pub fn check_incoming(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Err(ValidationError::MailboxDisabled(self.email.clone()));
        }
        if self.status != MailboxStatus::Active {
            return Err(ValidationError::MailboxInactive(self.email.clone()));
        }
        if !self.incoming {
            return Err(ValidationError::MailboxNotIncoming(self.email.clone()));
        }
        Ok(())
    }
}

/// An address that expands at intake time to a set of destination mailboxes.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MailAlias {
    pub alias: String,
    pub domain_name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MailboxRepository {
    pool: PgPool,
}

impl MailboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, email: &str) -> Result<Option<Mailbox>, Error> {
        Ok(
            sqlx::query_as::<_, Mailbox>("SELECT * FROM mailboxes WHERE email = $1")
                .bind(email.to_lowercase())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_for_user(&self, user: &str) -> Result<Vec<Mailbox>, Error> {
        Ok(sqlx::query_as::<_, Mailbox>(
            "SELECT * FROM mailboxes WHERE \"user\" = $1 ORDER BY email",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The user's default outgoing mailbox, if one is configured.
    pub async fn default_sender(&self, user: &str) -> Result<Option<Mailbox>, Error> {
        Ok(sqlx::query_as::<_, Mailbox>(
            r#"
            SELECT * FROM mailboxes
            WHERE "user" = $1 AND enabled AND is_default AND outgoing AND status = 'active'
            LIMIT 1
            "#,
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[derive(Clone)]
pub struct AliasRepository {
    pool: PgPool,
}

impl AliasRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, alias: &str) -> Result<Option<MailAlias>, Error> {
        Ok(
            sqlx::query_as::<_, MailAlias>("SELECT * FROM mail_aliases WHERE alias = $1")
                .bind(alias.to_lowercase())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Enabled destination mailboxes of an alias, in stable order.
    pub async fn destinations(&self, alias: &str) -> Result<Vec<Mailbox>, Error> {
        Ok(sqlx::query_as::<_, Mailbox>(
            r#"
            SELECT m.* FROM mailboxes m
                JOIN mail_alias_mailboxes am ON am.mailbox_email = m.email
            WHERE am.alias = $1 AND m.enabled AND m.incoming AND m.status = 'active'
            ORDER BY m.email
            "#,
        )
        .bind(alias.to_lowercase())
        .fetch_all(&self.pool)
        .await?)
    }

    /// Attach a destination mailbox. An alias may not point at itself.
    pub async fn add_destination(&self, alias: &str, mailbox: &str) -> Result<(), Error> {
        if alias.eq_ignore_ascii_case(mailbox) {
            return Err(Error::Internal(format!(
                "alias {alias} may not contain its own address"
            )));
        }
        sqlx::query(
            "INSERT INTO mail_alias_mailboxes (alias, mailbox_email) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(alias.to_lowercase())
        .bind(mailbox.to_lowercase())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

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

    #[test]
    fn domain_part_must_match() {
        assert!(mailbox().validate_domain_part().is_ok());

        let mismatched = Mailbox {
            domain_name: "other.test".to_owned(),
            ..mailbox()
        };
        assert!(matches!(
            mismatched.validate_domain_part(),
            Err(ValidationError::InvalidEmail(_))
        ));
    }

    #[test]
    fn capability_checks() {
        assert!(mailbox().check_outgoing().is_ok());
        assert!(mailbox().check_incoming().is_ok());

        let disabled = Mailbox {
            enabled: false,
            ..mailbox()
        };
        assert!(matches!(
            disabled.check_outgoing(),
            Err(ValidationError::MailboxDisabled(_))
        ));

        let receive_only = Mailbox {
            outgoing: false,
            ..mailbox()
        };
        assert!(matches!(
            receive_only.check_outgoing(),
            Err(ValidationError::MailboxNotOutgoing(_))
        ));
        assert!(receive_only.check_incoming().is_ok());

        let inactive = Mailbox {
            status: MailboxStatus::Disabled,
            ..mailbox()
        };
        assert!(matches!(
            inactive.check_incoming(),
            Err(ValidationError::MailboxInactive(_))
        ));
    }
}
