use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{MessageId, SessionId, UserId},
    error::SyncError,
};
use tokio::{
    sync::Mutex,
    time::Instant,
};
use tracing::warn;

use crate::{
    api::ApiClient,
    directory::SessionDirectory,
    event_bus::{BusEvent, EventBus},
    store::MessageStore,
};

struct TrackerState {
    session: Option<SessionId>,
    visible_since: HashMap<MessageId, Instant>,
}

/// Visibility-driven read-receipt accounting. The embedding view calls
/// `observe` when at least half of a message's rendered extent becomes
/// visible and `unobserve` when it drops below; a message becomes a
/// candidate once it has stayed visible for the debounce interval, and
/// candidates leave in one batched acknowledgement.
pub struct ReadReceiptTracker {
    user_id: UserId,
    api: Arc<ApiClient>,
    store: Arc<Mutex<MessageStore>>,
    directory: Arc<Mutex<SessionDirectory>>,
    bus: EventBus,
    debounce: Duration,
    inner: Mutex<TrackerState>,
}

impl ReadReceiptTracker {
    pub fn new(
        user_id: UserId,
        api: Arc<ApiClient>,
        store: Arc<Mutex<MessageStore>>,
        directory: Arc<Mutex<SessionDirectory>>,
        bus: EventBus,
        debounce: Duration,
    ) -> Self {
        Self {
            user_id,
            api,
            store,
            directory,
            bus,
            debounce,
            inner: Mutex::new(TrackerState {
                session: None,
                visible_since: HashMap::new(),
            }),
        }
    }

    pub async fn observe(&self, message_id: MessageId) {
        let mut inner = self.inner.lock().await;
        inner
            .visible_since
            .entry(message_id)
            .or_insert_with(Instant::now);
    }

    pub async fn unobserve(&self, message_id: MessageId) {
        self.inner.lock().await.visible_since.remove(&message_id);
    }

    /// Sends one acknowledgement for everything that has debounced, then
    /// decrements the session's unread count by exactly the batch size.
    pub async fn flush(&self) -> Result<usize, SyncError> {
        let (session_id, candidates) = {
            let inner = self.inner.lock().await;
            let Some(session_id) = inner.session else {
                return Ok(0);
            };
            let now = Instant::now();
            let candidates: Vec<MessageId> = inner
                .visible_since
                .iter()
                .filter(|(_, since)| now.duration_since(**since) >= self.debounce)
                .map(|(id, _)| *id)
                .collect();
            (session_id, candidates)
        };

        let candidates = self.filter_unread(session_id, candidates).await;
        if candidates.is_empty() {
            return Ok(0);
        }

        self.api.mark_read(session_id, &candidates).await?;

        let read_at = Utc::now();
        self.store
            .lock()
            .await
            .mark_read_by(session_id, self.user_id, &candidates, read_at);

        let batch = candidates.len() as u32;
        let unread = self
            .directory
            .lock()
            .await
            .decrement_unread(session_id, batch);
        self.bus.publish(BusEvent::UnreadChanged {
            session_id,
            unread,
        });

        let mut inner = self.inner.lock().await;
        for id in &candidates {
            inner.visible_since.remove(id);
        }
        Ok(candidates.len())
    }

    /// Flushes the outgoing session's batch, then switches tracking to the
    /// new session.
    pub async fn activate_session(&self, session_id: Option<SessionId>) {
        if let Err(err) = self.flush().await {
            warn!(error = %err, "read-receipt flush failed during session switch");
        }
        let mut inner = self.inner.lock().await;
        inner.session = session_id;
        inner.visible_since.clear();
    }

    /// Receipts are only owed for other senders' messages not yet read by
    /// the local user.
    async fn filter_unread(
        &self,
        session_id: SessionId,
        candidates: Vec<MessageId>,
    ) -> Vec<MessageId> {
        if candidates.is_empty() {
            return candidates;
        }
        let store = self.store.lock().await;
        let messages = store.messages(session_id);
        candidates
            .into_iter()
            .filter(|id| {
                messages.iter().any(|m| {
                    m.message_id == Some(*id)
                        && m.sender_id != self.user_id
                        && !m.read_by.contains_key(&self.user_id)
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/read_receipts_tests.rs"]
mod tests;
