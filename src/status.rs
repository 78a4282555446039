use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, OUTGOING_MAIL_STATUS_QUEUE};
use crate::error::MailError;
use crate::events::{EventBus, MailEvent};
use crate::models::{
    derive_status, recipient_advances, OutgoingMailRepository, RecipientStatus,
};
use crate::utils::{diff_seconds, parse_addr};

/// One recipient as reported by an agent hook. `original` carries the
/// RFC 5322 form the agent saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRecipient {
    pub original: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Connection details an agent reports alongside a successful delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryParams {
    pub host: Option<String>,
    pub ip: Option<String>,
    pub response: Option<String>,
    pub delay: Option<f64>,
    pub port: Option<u16>,
    pub mode: Option<String>,
    pub secured: Option<bool>,
    pub verified: Option<bool>,
}

/// Delivery hooks consumed from the status queue, discriminated by the
/// `hook` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum StatusHook {
    QueueOk {
        outgoing_mail: Option<Uuid>,
        queue_id: String,
    },
    Deferred {
        outgoing_mail: Option<Uuid>,
        queue_id: Option<String>,
        retries: i32,
        action_at: DateTime<Utc>,
        rcpt_to: Vec<HookRecipient>,
    },
    Bounce {
        outgoing_mail: Option<Uuid>,
        queue_id: Option<String>,
        retries: i32,
        action_at: DateTime<Utc>,
        rcpt_to: Vec<HookRecipient>,
    },
    Delivered {
        outgoing_mail: Option<Uuid>,
        queue_id: Option<String>,
        retries: i32,
        action_at: DateTime<Utc>,
        ok_recips: Vec<HookRecipient>,
        #[serde(default)]
        params: DeliveryParams,
    },
}

impl StatusHook {
    fn lookup(&self) -> (Option<Uuid>, Option<&str>) {
        match self {
            StatusHook::QueueOk {
                outgoing_mail,
                queue_id,
            } => (*outgoing_mail, Some(queue_id.as_str())),
            StatusHook::Deferred {
                outgoing_mail,
                queue_id,
                ..
            }
            | StatusHook::Bounce {
                outgoing_mail,
                queue_id,
                ..
            }
            | StatusHook::Delivered {
                outgoing_mail,
                queue_id,
                ..
            } => (*outgoing_mail, queue_id.as_deref()),
        }
    }
}

/// Folds per-recipient delivery hooks back into the outgoing mail rows.
#[derive(Clone)]
pub struct StatusReconciler {
    pool: PgPool,
    repository: OutgoingMailRepository,
    broker: Broker,
    events: EventBus,
}

impl StatusReconciler {
    pub fn new(pool: PgPool, broker: Broker, events: EventBus) -> Self {
        Self {
            repository: OutgoingMailRepository::new(pool.clone()),
            pool,
            broker,
            events,
        }
    }

    /// Drain the status queue. Messages are acked per message and only on
    /// success, so a crash mid-batch redelivers the rest.
    pub async fn run_once(&self) -> Result<u64, MailError> {
        self.broker
            .declare_queue(OUTGOING_MAIL_STATUS_QUEUE, 3)
            .await?;
        self.broker
            .drain(OUTGOING_MAIL_STATUS_QUEUE, |body, app_id| async move {
                let hook: StatusHook = match serde_json::from_slice(&body) {
                    Ok(hook) => hook,
                    Err(e) => {
                        // poison message, drop it rather than loop forever
                        warn!("undecodable status hook, dropping: {e}");
                        return Ok(());
                    }
                };
                self.apply(hook, app_id.as_deref()).await
            })
            .await
    }

    /// Apply one hook inside a transaction: the recipient updates and the
    /// recomputed mail status commit together.
    pub async fn apply(&self, hook: StatusHook, agent: Option<&str>) -> Result<(), MailError> {
        let mut tx = self.pool.begin().await?;

        let (mail_id, queue_id) = hook.lookup();
        let locked = match mail_id {
            Some(id) => self.repository.lock(&mut tx, id).await?,
            None => match queue_id {
                Some(queue_id) => self.repository.lock_by_queue_id(&mut tx, queue_id).await?,
                None => None,
            },
        };
        let Some(id) = locked else {
            // unknown mail: log and ack so the queue keeps moving
            info!(?mail_id, ?queue_id, "status hook for unknown mail, ignoring");
            return Ok(());
        };

        match hook {
            StatusHook::QueueOk { queue_id, .. } => {
                let agent = agent.unwrap_or("unknown");
                self.repository
                    .set_queued(&mut tx, id, agent, &queue_id)
                    .await?;
                debug!(mail_id = %id, queue_id, agent, "mail queued at agent");
            }
            StatusHook::Deferred {
                retries,
                action_at,
                rcpt_to,
                ..
            } => {
                self.update_recipients(
                    &mut tx,
                    id,
                    RecipientStatus::Deferred,
                    retries,
                    action_at,
                    &rcpt_to,
                    None,
                )
                .await?;
            }
            StatusHook::Bounce {
                retries,
                action_at,
                rcpt_to,
                ..
            } => {
                self.update_recipients(
                    &mut tx,
                    id,
                    RecipientStatus::Bounced,
                    retries,
                    action_at,
                    &rcpt_to,
                    None,
                )
                .await?;
            }
            StatusHook::Delivered {
                retries,
                action_at,
                ok_recips,
                params,
                ..
            } => {
                let details = serde_json::to_value(&params)
                    .map_err(|e| MailError::Storage(e.into()))?;
                self.update_recipients(
                    &mut tx,
                    id,
                    RecipientStatus::Sent,
                    retries,
                    action_at,
                    &ok_recips,
                    Some(details),
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_recipients(
        &self,
        tx: &mut sqlx::PgConnection,
        id: Uuid,
        status: RecipientStatus,
        retries: i32,
        action_at: DateTime<Utc>,
        hook_recipients: &[HookRecipient],
        shared_details: Option<serde_json::Value>,
    ) -> Result<(), MailError> {
        let transferred_at = self.repository.transferred_at_of(tx, id).await?;
        let action_after = transferred_at.map(|t| diff_seconds(action_at, t));

        let mut matched: Vec<(String, serde_json::Value)> = Vec::new();
        for hook_recipient in hook_recipients {
            let Ok((_, email)) = parse_addr(&hook_recipient.original) else {
                warn!(mail_id = %id, "unparseable hook recipient {}", hook_recipient.original);
                continue;
            };
            let details = match &shared_details {
                Some(details) => details.clone(),
                None => serde_json::to_value(hook_recipient)
                    .map_err(|e| MailError::Storage(e.into()))?,
            };
            matched.push((email, details));
        }

        let recipients = self.repository.recipients_for_update(tx, id).await?;
        for recipient in &recipients {
            let Some((_, details)) = matched.iter().find(|(email, _)| *email == recipient.email)
            else {
                continue;
            };
            if !recipient_advances(recipient.status, status) {
                debug!(
                    mail_id = %id,
                    recipient = recipient.email,
                    "ignoring non-forward status transition {:?} -> {:?}",
                    recipient.status,
                    status,
                );
                continue;
            }
            self.repository
                .update_recipient(tx, id, &recipient.email, status, retries, action_at, action_after, details)
                .await?;
        }

        // recompute the mail-level status in the same transaction
        let recipients = self.repository.recipients_for_update(tx, id).await?;
        let mail_status = derive_status(&recipients);
        self.repository
            .set_status_in_tx(tx, id, mail_status)
            .await?;

        self.events.publish(MailEvent::OutgoingMailStatusChanged {
            mail_id: id,
            status: mail_status,
        });

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hooks_deserialize_by_discriminator() {
        let queue_ok: StatusHook = serde_json::from_str(
            r#"{"hook": "queue_ok", "outgoing_mail": null, "queue_id": "Q1"}"#,
        )
        .unwrap();
        assert!(matches!(
            queue_ok,
            StatusHook::QueueOk { queue_id, .. } if queue_id == "Q1"
        ));

        let deferred: StatusHook = serde_json::from_str(
            r#"{
                "hook": "deferred",
                "queue_id": "Q1",
                "retries": 2,
                "action_at": "2025-01-06T10:30:00Z",
                "rcpt_to": [{"original": "Bob <bob@peer.test>", "dsn": "4.4.1"}]
            }"#,
        )
        .unwrap();
        let StatusHook::Deferred {
            retries, rcpt_to, ..
        } = deferred
        else {
            panic!("wrong variant");
        };
        assert_eq!(retries, 2);
        assert_eq!(rcpt_to[0].original, "Bob <bob@peer.test>");
        assert_eq!(rcpt_to[0].extra["dsn"], "4.4.1");

        let delivered: StatusHook = serde_json::from_str(
            r#"{
                "hook": "delivered",
                "outgoing_mail": "01920000-0000-7000-8000-000000000000",
                "retries": 0,
                "action_at": "2025-01-06T10:31:00Z",
                "ok_recips": [{"original": "bob@peer.test"}],
                "params": {"host": "mx.peer.test", "ip": "203.0.113.1", "port": 25, "secured": true}
            }"#,
        )
        .unwrap();
        let StatusHook::Delivered { params, .. } = delivered else {
            panic!("wrong variant");
        };
        assert_eq!(params.host.as_deref(), Some("mx.peer.test"));
        assert_eq!(params.port, Some(25));
    }

    #[test]
    fn delivered_hook_without_params_still_decodes() {
        let delivered: StatusHook = serde_json::from_str(
            r#"{
                "hook": "delivered",
                "queue_id": "Q9",
                "retries": 1,
                "action_at": "2025-01-06T10:31:00Z",
                "ok_recips": []
            }"#,
        )
        .unwrap();
        let StatusHook::Delivered { params, .. } = delivered else {
            panic!("wrong variant");
        };
        assert!(params.host.is_none());
    }

    #[test]
    fn lookup_prefers_mail_id_over_queue_id() {
        let id = Uuid::now_v7();
        let hook = StatusHook::Bounce {
            outgoing_mail: Some(id),
            queue_id: Some("Q1".to_owned()),
            retries: 0,
            action_at: Utc::now(),
            rcpt_to: vec![],
        };
        assert_eq!(hook.lookup(), (Some(id), Some("Q1")));

        let hook = StatusHook::QueueOk {
            outgoing_mail: None,
            queue_id: "Q2".to_owned(),
        };
        assert_eq!(hook.lookup(), (None, Some("Q2")));
    }
}
