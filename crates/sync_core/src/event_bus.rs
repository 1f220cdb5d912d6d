use shared::domain::{ClientMessageId, SessionId, UserId};
use tokio::sync::broadcast;

use crate::rate_limit::ActionKind;

/// In-process notifications decoupling UI intents from the components that
/// react to them. Receivers that lag are dropped by the broadcast channel;
/// every event is also observable through the controller's view model.
#[derive(Debug, Clone)]
pub enum BusEvent {
    TypingObserved {
        session_id: SessionId,
        user_id: UserId,
    },
    TypingCleared {
        session_id: SessionId,
        user_id: UserId,
    },
    SlowDown {
        kind: ActionKind,
    },
    SendFailed {
        session_id: SessionId,
        client_id: ClientMessageId,
        reason: String,
    },
    UnreadChanged {
        session_id: SessionId,
        unread: u32,
    },
    ChatListReordered,
    AudioRoomChanged {
        session_id: SessionId,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
