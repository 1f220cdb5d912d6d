use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use shared::{
    domain::{ClientMessageId, DeliveryStatus, MessageId, SessionId, UserId},
    error::SyncError,
    protocol::{ClientRequest, MessageContent, MessagePayload},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex, RwLock},
    time::timeout,
};

use super::{MessageSyncEngine, SendState};
use crate::{
    api::{ApiClient, SendMessageHttpRequest},
    event_bus::{BusEvent, EventBus},
    rate_limit::{ActionKind, RateLimiter, WindowLimit},
    store::MessageStore,
    transport::{ChannelEvent, LiveChannel, MissingLiveChannel},
};

#[derive(Clone)]
struct SendServerState {
    requests: Arc<Mutex<Vec<SendMessageHttpRequest>>>,
    fail: Arc<AtomicBool>,
    next_id: Arc<AtomicI64>,
}

async fn handle_send(
    State(state): State<SendServerState>,
    Json(request): Json<SendMessageHttpRequest>,
) -> Result<Json<MessagePayload>, StatusCode> {
    if state.fail.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().await.push(request.clone());
    Ok(Json(MessagePayload {
        message_id: MessageId(id),
        client_id: request.client_id,
        session_id: SessionId(request.session_id),
        sender_id: UserId(request.user_id),
        sender_name: None,
        content: request.content,
        sent_at: Utc::now(),
    }))
}

async fn spawn_send_server() -> Result<(String, SendServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = SendServerState {
        requests: Arc::new(Mutex::new(Vec::new())),
        fail: Arc::new(AtomicBool::new(false)),
        next_id: Arc::new(AtomicI64::new(42)),
    };
    let app = Router::new()
        .route("/messages", post(handle_send))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

/// Live channel that accepts submissions but never acknowledges them.
struct SilentLiveChannel {
    submitted: Arc<Mutex<Vec<ClientRequest>>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl SilentLiveChannel {
    fn new() -> Self {
        Self {
            submitted: Arc::new(Mutex::new(Vec::new())),
            events: broadcast::channel(32).0,
        }
    }
}

#[async_trait]
impl LiveChannel for SilentLiveChannel {
    async fn submit(&self, request: ClientRequest) -> Result<()> {
        self.submitted.lock().await.push(request);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct Harness {
    engine: Arc<MessageSyncEngine>,
    store: Arc<Mutex<MessageStore>>,
    bus: EventBus,
}

fn harness(
    server_url: &str,
    live: Arc<dyn LiveChannel>,
    limiter: RateLimiter,
    fallback: Duration,
) -> Harness {
    let store = Arc::new(Mutex::new(MessageStore::new()));
    let bus = EventBus::default();
    let active = Arc::new(RwLock::new(Some(SessionId(1))));
    let engine = MessageSyncEngine::new(
        UserId(7),
        Arc::clone(&store),
        live,
        Arc::new(ApiClient::new(server_url, UserId(7))),
        Arc::new(limiter),
        bus.clone(),
        active,
        fallback,
    );
    Harness { engine, store, bus }
}

async fn wait_for<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(2), async {
        loop {
            if check().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn incoming(message_id: i64, session: i64, sender: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(message_id),
        client_id: ClientMessageId::new(),
        session_id: SessionId(session),
        sender_id: UserId(sender),
        sender_name: Some("bob".to_string()),
        content: MessageContent::text("hey"),
        sent_at: Utc::now(),
    }
}

#[tokio::test]
async fn offline_send_falls_back_to_http_and_reconciles() {
    let (server_url, server) = spawn_send_server().await.expect("spawn server");
    let h = harness(
        &server_url,
        Arc::new(MissingLiveChannel::new()),
        RateLimiter::with_default_limits(),
        Duration::from_millis(50),
    );

    let pending = h
        .engine
        .send(SessionId(1), MessageContent::text("hello"))
        .await
        .expect("send");
    assert_eq!(pending.state, SendState::AwaitingLiveAck);

    // Optimistic entry is visible before any confirmation.
    assert_eq!(h.store.lock().await.len(SessionId(1)), 1);

    let store = Arc::clone(&h.store);
    wait_for("http reconciliation", || {
        let store = Arc::clone(&store);
        async move {
            let messages = store.lock().await.messages(SessionId(1));
            messages.len() == 1
                && messages[0].message_id == Some(MessageId(42))
                && messages[0].status == DeliveryStatus::Sent
        }
    })
    .await;

    assert_eq!(server.requests.lock().await.len(), 1);
    assert_eq!(h.engine.pending_count().await, 0);
}

#[tokio::test]
async fn both_paths_succeeding_leaves_exactly_one_entry() {
    let (server_url, _server) = spawn_send_server().await.expect("spawn server");
    let h = harness(
        &server_url,
        Arc::new(MissingLiveChannel::new()),
        RateLimiter::with_default_limits(),
        Duration::from_millis(20),
    );

    h.engine
        .send(SessionId(1), MessageContent::text("hello"))
        .await
        .expect("send");

    let store = Arc::clone(&h.store);
    wait_for("http confirmation", || {
        let store = Arc::clone(&store);
        async move {
            store
                .lock()
                .await
                .messages(SessionId(1))
                .first()
                .is_some_and(|m| m.message_id.is_some())
        }
    })
    .await;

    // The live channel reports success for the same logical send afterwards.
    let confirmed = h.store.lock().await.messages(SessionId(1));
    let echo = MessagePayload {
        message_id: confirmed[0].message_id.expect("confirmed id"),
        client_id: confirmed[0].client_id,
        session_id: SessionId(1),
        sender_id: UserId(7),
        sender_name: None,
        content: confirmed[0].content.clone(),
        sent_at: confirmed[0].sent_at,
    };
    let rendered = h.engine.on_incoming(echo).await;

    assert!(rendered.is_none());
    assert_eq!(h.store.lock().await.len(SessionId(1)), 1);
}

#[tokio::test]
async fn silent_live_channel_escalates_to_http_after_timeout() {
    let (server_url, server) = spawn_send_server().await.expect("spawn server");
    let live = Arc::new(SilentLiveChannel::new());
    let submitted = Arc::clone(&live.submitted);
    let h = harness(
        &server_url,
        live,
        RateLimiter::with_default_limits(),
        Duration::from_millis(50),
    );

    h.engine
        .send(SessionId(1), MessageContent::text("hello"))
        .await
        .expect("send");

    let store = Arc::clone(&h.store);
    wait_for("fallback confirmation", || {
        let store = Arc::clone(&store);
        async move {
            store
                .lock()
                .await
                .messages(SessionId(1))
                .first()
                .is_some_and(|m| m.status == DeliveryStatus::Sent)
        }
    })
    .await;

    // The live path was tried first, then exactly one http retry.
    assert_eq!(submitted.lock().await.len(), 1);
    assert_eq!(server.requests.lock().await.len(), 1);
}

#[tokio::test]
async fn failure_on_both_channels_rolls_back_and_signals() {
    let (server_url, server) = spawn_send_server().await.expect("spawn server");
    server.fail.store(true, Ordering::SeqCst);
    let h = harness(
        &server_url,
        Arc::new(MissingLiveChannel::new()),
        RateLimiter::with_default_limits(),
        Duration::from_millis(20),
    );
    let mut bus_rx = h.bus.subscribe();

    h.engine
        .send(SessionId(1), MessageContent::text("doomed"))
        .await
        .expect("send");

    let failed = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(BusEvent::SendFailed { session_id, .. }) = bus_rx.recv().await {
                break session_id;
            }
        }
    })
    .await
    .expect("send-failed signal");

    assert_eq!(failed, SessionId(1));
    assert_eq!(h.store.lock().await.len(SessionId(1)), 0);
    assert_eq!(h.engine.pending_count().await, 0);
}

#[tokio::test]
async fn rate_limited_send_is_rejected_without_an_entry() {
    let (server_url, _server) = spawn_send_server().await.expect("spawn server");
    let mut limits = std::collections::HashMap::new();
    limits.insert(
        ActionKind::MessageSend,
        WindowLimit {
            max: 1,
            window: Duration::from_secs(60),
        },
    );
    let h = harness(
        &server_url,
        Arc::new(MissingLiveChannel::new()),
        RateLimiter::new(limits),
        Duration::from_millis(20),
    );

    h.engine
        .send(SessionId(1), MessageContent::text("first"))
        .await
        .expect("first send");
    let denied = h
        .engine
        .send(SessionId(1), MessageContent::text("second"))
        .await;

    assert!(matches!(denied, Err(SyncError::RateLimited(_))));
    assert_eq!(h.store.lock().await.len(SessionId(1)), 1);
}

#[tokio::test]
async fn incoming_for_inactive_session_is_not_rendered() {
    let (server_url, _server) = spawn_send_server().await.expect("spawn server");
    let h = harness(
        &server_url,
        Arc::new(MissingLiveChannel::new()),
        RateLimiter::with_default_limits(),
        Duration::from_millis(20),
    );

    let rendered = h.engine.on_incoming(incoming(9, 2, 8)).await;
    assert!(rendered.is_none());
    assert_eq!(h.store.lock().await.len(SessionId(2)), 0);

    let rendered = h.engine.on_incoming(incoming(10, 1, 8)).await;
    assert!(rendered.is_some());
    assert_eq!(h.store.lock().await.len(SessionId(1)), 1);
}

#[tokio::test]
async fn duplicate_incoming_event_is_dropped() {
    let (server_url, _server) = spawn_send_server().await.expect("spawn server");
    let h = harness(
        &server_url,
        Arc::new(MissingLiveChannel::new()),
        RateLimiter::with_default_limits(),
        Duration::from_millis(20),
    );

    let message = incoming(11, 1, 8);
    assert!(h.engine.on_incoming(message.clone()).await.is_some());
    assert!(h.engine.on_incoming(message).await.is_none());
    assert_eq!(h.store.lock().await.len(SessionId(1)), 1);
}
