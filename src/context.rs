use crate::error::AuthError;
use crate::models::Mailbox;

/// Identity and origin of the caller, passed explicitly to every core
/// operation instead of living in ambient request state.
#[derive(Debug, Clone)]
pub struct Context {
    pub user: String,
    pub request_ip: String,
    /// Value of the `X-Site` request header, when present.
    pub site: Option<String>,
    pub system_manager: bool,
    pub postmaster: bool,
}

impl Context {
    pub fn user(user: impl Into<String>, request_ip: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            request_ip: request_ip.into(),
            site: None,
            system_manager: false,
            postmaster: false,
        }
    }

    /// Context used by background workers acting on behalf of the platform.
    pub fn system(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            request_ip: "127.0.0.1".to_owned(),
            site: None,
            system_manager: true,
            postmaster: true,
        }
    }

    /// Sync-cursor source key: the `X-Site` header when the client sent one,
    /// otherwise the request IP.
    pub fn source(&self) -> &str {
        self.site.as_deref().unwrap_or(&self.request_ip)
    }

    pub fn require_mailbox_owner(&self, mailbox: &Mailbox) -> Result<(), AuthError> {
        if self.system_manager || mailbox.user == self.user {
            return Ok(());
        }
        Err(AuthError::NotMailboxOwner {
            user: self.user.clone(),
            mailbox: mailbox.email.clone(),
        })
    }

    pub fn require_system_manager(&self) -> Result<(), AuthError> {
        if self.system_manager {
            return Ok(());
        }
        Err(AuthError::NotSystemManager(self.user.clone()))
    }

    pub fn require_postmaster(&self) -> Result<(), AuthError> {
        if self.postmaster || self.system_manager {
            return Ok(());
        }
        Err(AuthError::NotPostmaster(self.user.clone()))
    }
}
