use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::OutgoingStatus;

/// Realtime notifications fanned out to interested listeners (websocket
/// bridges, test harnesses). Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MailEvent {
    IncomingMailReceived { mailbox: String, mail_id: Uuid },
    OutgoingMailStatusChanged { mail_id: Uuid, status: OutgoingStatus },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MailEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish without caring whether anyone listens.
    pub fn publish(&self, event: MailEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
