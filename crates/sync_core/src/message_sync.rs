use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMessageId, MessageId, SessionId, UserId},
    error::SyncError,
    protocol::{ClientRequest, MessageContent, MessagePayload},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    api::ApiClient,
    event_bus::{BusEvent, EventBus},
    rate_limit::{ActionKind, RateLimiter},
    store::{ConfirmOutcome, MessageStore, StoredMessage},
    transport::LiveChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    AwaitingLiveAck,
    FallbackInFlight,
}

/// Saga record for one in-flight send. Exists from the optimistic append
/// until a confirmation or terminal failure removes it.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub client_id: ClientMessageId,
    pub session_id: SessionId,
    pub state: SendState,
    pub attempts: u32,
}

/// Dual-channel message delivery: optimistic local append, live-channel
/// submit, one HTTP retry after the fallback timeout. Both paths may race;
/// the store's client-id keyed `confirm` keeps the visible list at one entry
/// per logical send.
pub struct MessageSyncEngine {
    user_id: UserId,
    store: Arc<Mutex<MessageStore>>,
    live: Arc<dyn LiveChannel>,
    api: Arc<ApiClient>,
    limiter: Arc<RateLimiter>,
    bus: EventBus,
    active_session: Arc<RwLock<Option<SessionId>>>,
    pending: Mutex<HashMap<ClientMessageId, PendingMessage>>,
    fallback_timeout: Duration,
}

impl MessageSyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        store: Arc<Mutex<MessageStore>>,
        live: Arc<dyn LiveChannel>,
        api: Arc<ApiClient>,
        limiter: Arc<RateLimiter>,
        bus: EventBus,
        active_session: Arc<RwLock<Option<SessionId>>>,
        fallback_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            store,
            live,
            api,
            limiter,
            bus,
            active_session,
            pending: Mutex::new(HashMap::new()),
            fallback_timeout,
        })
    }

    /// Creates the optimistic entry and starts the delivery saga. The entry
    /// is visible before any network round-trip completes.
    pub async fn send(
        self: &Arc<Self>,
        session_id: SessionId,
        content: MessageContent,
    ) -> Result<PendingMessage, SyncError> {
        if !self.limiter.allow(self.user_id, ActionKind::MessageSend).await {
            self.bus.publish(BusEvent::SlowDown {
                kind: ActionKind::MessageSend,
            });
            return Err(SyncError::RateLimited("message send window exhausted"));
        }

        let client_id = ClientMessageId::new();
        let sent_at = Utc::now();
        self.store.lock().await.append_pending(StoredMessage::pending(
            client_id,
            session_id,
            self.user_id,
            content.clone(),
            sent_at,
        ));

        let record = PendingMessage {
            client_id,
            session_id,
            state: SendState::AwaitingLiveAck,
            attempts: 0,
        };
        self.pending.lock().await.insert(client_id, record.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drive_send(client_id, session_id, content).await;
        });

        Ok(record)
    }

    async fn drive_send(
        self: Arc<Self>,
        client_id: ClientMessageId,
        session_id: SessionId,
        content: MessageContent,
    ) {
        if self.live.is_connected() {
            let submitted = self
                .live
                .submit(ClientRequest::SendMessage {
                    client_id,
                    session_id,
                    content: content.clone(),
                })
                .await;

            match submitted {
                Ok(()) => {
                    tokio::time::sleep(self.fallback_timeout).await;
                    if !self.is_unconfirmed(client_id).await {
                        return;
                    }
                    debug!(
                        session_id = session_id.0,
                        "no live acknowledgement within timeout, escalating to http"
                    );
                }
                Err(err) => {
                    warn!(
                        session_id = session_id.0,
                        error = %err,
                        "live-channel submit failed, escalating to http"
                    );
                }
            }
        }

        self.fallback_over_http(client_id, session_id, content).await;
    }

    async fn fallback_over_http(
        &self,
        client_id: ClientMessageId,
        session_id: SessionId,
        content: MessageContent,
    ) {
        {
            let mut pending = self.pending.lock().await;
            let Some(record) = pending.get_mut(&client_id) else {
                return;
            };
            record.state = SendState::FallbackInFlight;
            record.attempts += 1;
        }

        match self.api.send_message(session_id, client_id, content).await {
            Ok(payload) => {
                self.confirm(payload).await;
            }
            Err(err) => {
                if self.is_unconfirmed(client_id).await {
                    self.fail_send(session_id, client_id, err).await;
                }
            }
        }
    }

    /// Applies a server confirmation from either delivery path. First one
    /// wins; the loser resolves to `Duplicate` and changes nothing.
    pub async fn confirm(&self, payload: MessagePayload) -> ConfirmOutcome {
        self.pending.lock().await.remove(&payload.client_id);
        self.store.lock().await.confirm(payload)
    }

    /// Inbound message event. Own echoes reconcile regardless of the active
    /// session; messages for inactive sessions are dropped for display (the
    /// controller still does unread/ordering bookkeeping for them).
    pub async fn on_incoming(&self, payload: MessagePayload) -> Option<StoredMessage> {
        let active = *self.active_session.read().await;

        if payload.sender_id == self.user_id {
            let outcome = self.confirm(payload.clone()).await;
            if outcome == ConfirmOutcome::Duplicate || active != Some(payload.session_id) {
                return None;
            }
            return Some(StoredMessage::confirmed(payload));
        }

        if active != Some(payload.session_id) {
            return None;
        }

        match self.store.lock().await.confirm(payload.clone()) {
            ConfirmOutcome::Duplicate => None,
            _ => Some(StoredMessage::confirmed(payload)),
        }
    }

    pub async fn on_delivered(&self, session_id: SessionId, message_ids: &[MessageId]) -> usize {
        self.store
            .lock()
            .await
            .mark_delivered(session_id, message_ids)
    }

    pub async fn on_read(
        &self,
        session_id: SessionId,
        reader_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> usize {
        self.store
            .lock()
            .await
            .mark_read_by(session_id, reader_id, message_ids, read_at)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn is_unconfirmed(&self, client_id: ClientMessageId) -> bool {
        self.pending.lock().await.contains_key(&client_id)
    }

    /// Both channels failed: the optimistic entry is removed and a retryable
    /// failure is surfaced. A user-authored message is never dropped
    /// silently.
    async fn fail_send(&self, session_id: SessionId, client_id: ClientMessageId, err: SyncError) {
        warn!(
            session_id = session_id.0,
            error = %err,
            "send failed on both channels, rolling back optimistic entry"
        );
        self.pending.lock().await.remove(&client_id);
        self.store
            .lock()
            .await
            .remove_pending(session_id, client_id);
        self.bus.publish(BusEvent::SendFailed {
            session_id,
            client_id,
            reason: err.to_string(),
        });
    }
}

#[cfg(test)]
#[path = "tests/message_sync_tests.rs"]
mod tests;
