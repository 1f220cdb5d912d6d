use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use media_transport::{
    IceCandidate, IceServer, LocalAudioTrack, MediaDevices, MediaError, PeerConnection,
    PeerConnectionState, PeerConnector, PeerEvent, SessionDescription,
};
use shared::{
    domain::{SessionId, UserId},
    error::SyncError,
    protocol::{ClientRequest, SignalPayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    time::timeout,
};

use super::AudioSignalingEngine;
use crate::{
    event_bus::EventBus,
    transport::{ChannelEvent, LiveChannel},
};

struct MockTrack {
    enabled: AtomicBool,
    stops: AtomicU32,
}

impl MockTrack {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            stops: AtomicU32::new(0),
        })
    }
}

impl LocalAudioTrack for MockTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockConnection {
    events_tx: broadcast::Sender<PeerEvent>,
    remote_descriptions: StdMutex<Vec<SessionDescription>>,
    candidates: StdMutex<Vec<IceCandidate>>,
    attached_audio: AtomicBool,
    closes: AtomicU32,
}

impl MockConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events_tx: broadcast::channel(32).0,
            remote_descriptions: StdMutex::new(Vec::new()),
            candidates: StdMutex::new(Vec::new()),
            attached_audio: AtomicBool::new(false),
            closes: AtomicU32::new(0),
        })
    }

    fn push_state(&self, state: PeerConnectionState) {
        let _ = self
            .events_tx
            .send(PeerEvent::ConnectionStateChanged(state));
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            sdp: "offer-sdp".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            sdp: "answer-sdp".to_string(),
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.remote_descriptions.lock().expect("descs").push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().expect("candidates").push(candidate);
        Ok(())
    }

    async fn attach_local_audio(&self, _track: Arc<dyn LocalAudioTrack>) -> Result<()> {
        self.attached_audio.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }
}

struct MockConnector {
    connections: StdMutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: StdMutex::new(Vec::new()),
        })
    }

    fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock().expect("connections")[index].clone()
    }

    fn count(&self) -> usize {
        self.connections.lock().expect("connections").len()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn create_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>> {
        let conn = MockConnection::new();
        self.connections.lock().expect("connections").push(conn.clone());
        Ok(conn)
    }
}

struct MockMedia {
    track: Arc<MockTrack>,
    deny: bool,
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalAudioTrack>, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        Ok(self.track.clone())
    }
}

struct RecordingLiveChannel {
    submitted: Mutex<Vec<ClientRequest>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl RecordingLiveChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submitted: Mutex::new(Vec::new()),
            events: broadcast::channel(32).0,
        })
    }

    async fn signals(&self) -> Vec<(UserId, SignalPayload)> {
        self.submitted
            .lock()
            .await
            .iter()
            .filter_map(|request| match request {
                ClientRequest::Signal {
                    to_user_id,
                    payload,
                    ..
                } => Some((*to_user_id, payload.clone())),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LiveChannel for RecordingLiveChannel {
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

struct Peer {
    engine: Arc<AudioSignalingEngine>,
    connector: Arc<MockConnector>,
    live: Arc<RecordingLiveChannel>,
    track: Arc<MockTrack>,
}

fn peer(user: i64, deny_mic: bool) -> Peer {
    let connector = MockConnector::new();
    let live = RecordingLiveChannel::new();
    let track = MockTrack::new();
    let engine = AudioSignalingEngine::new(
        SessionId(1),
        UserId(user),
        connector.clone(),
        Arc::new(MockMedia {
            track: track.clone(),
            deny: deny_mic,
        }),
        live.clone(),
        EventBus::default(),
        IceServer::default_servers(),
    );
    Peer {
        engine,
        connector,
        live,
        track,
    }
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

#[tokio::test]
async fn caller_and_callee_negotiate_to_connected() {
    let a = peer(1, false);
    let b = peer(2, false);

    a.engine.acquire_microphone().await.expect("mic a");
    b.engine.acquire_microphone().await.expect("mic b");
    a.engine.add_participant(UserId(1), "a".into(), false).await;
    a.engine.add_participant(UserId(2), "b".into(), false).await;
    b.engine.add_participant(UserId(2), "b".into(), false).await;
    b.engine.add_participant(UserId(1), "a".into(), false).await;

    // A observes B's join and becomes caller.
    a.engine.connect_to(UserId(2)).await.expect("connect");
    let offers = a.live.signals().await;
    let Some((to, SignalPayload::Offer { sdp })) = offers.first().cloned() else {
        panic!("expected an offer, got {offers:?}");
    };
    assert_eq!(to, UserId(2));

    // B answers as callee.
    b.engine.handle_offer(UserId(1), sdp).await.expect("offer");
    let answers = b.live.signals().await;
    let Some((to, SignalPayload::Answer { sdp })) = answers.first().cloned() else {
        panic!("expected an answer, got {answers:?}");
    };
    assert_eq!(to, UserId(1));

    a.engine.handle_answer(UserId(2), sdp).await.expect("answer");

    a.connector.connection(0).push_state(PeerConnectionState::Connected);
    b.connector.connection(0).push_state(PeerConnectionState::Connected);

    let engine_a = a.engine.clone();
    wait_for("a sees b connected", || {
        let engine = engine_a.clone();
        async move {
            engine.room_snapshot().await.participants.iter().any(|p| {
                p.user_id == UserId(2) && p.connection_state == PeerConnectionState::Connected
            })
        }
    })
    .await;

    let engine_b = b.engine.clone();
    wait_for("b sees a connected", || {
        let engine = engine_b.clone();
        async move {
            engine.room_snapshot().await.participants.iter().any(|p| {
                p.user_id == UserId(1) && p.connection_state == PeerConnectionState::Connected
            })
        }
    })
    .await;
}

#[tokio::test]
async fn early_candidates_are_queued_until_remote_description() {
    let a = peer(1, false);
    a.engine.add_participant(UserId(2), "b".into(), false).await;
    a.engine.connect_to(UserId(2)).await.expect("connect");

    let first = IceCandidate {
        candidate: "candidate-1".to_string(),
        sdp_mid: None,
        sdp_mline_index: Some(0),
    };
    let second = IceCandidate {
        candidate: "candidate-2".to_string(),
        sdp_mid: None,
        sdp_mline_index: Some(0),
    };
    a.engine
        .handle_candidate(UserId(2), first.clone())
        .await
        .expect("candidate");
    a.engine
        .handle_candidate(UserId(2), second.clone())
        .await
        .expect("candidate");

    let conn = a.connector.connection(0);
    assert!(conn.candidates.lock().expect("candidates").is_empty());

    a.engine
        .handle_answer(UserId(2), "answer-sdp".to_string())
        .await
        .expect("answer");

    let applied = conn.candidates.lock().expect("candidates").clone();
    assert_eq!(applied, vec![first, second]);
}

#[tokio::test]
async fn duplicate_offer_does_not_create_a_second_connection() {
    let a = peer(1, false);
    a.engine.add_participant(UserId(2), "b".into(), false).await;
    a.engine.connect_to(UserId(2)).await.expect("connect");

    a.engine
        .handle_offer(UserId(2), "late-offer".to_string())
        .await
        .expect("offer");

    assert_eq!(a.connector.count(), 1);
}

#[tokio::test]
async fn teardown_is_idempotent_and_releases_everything() {
    let a = peer(1, false);
    a.engine.acquire_microphone().await.expect("mic");
    a.engine.add_participant(UserId(2), "b".into(), false).await;
    a.engine.connect_to(UserId(2)).await.expect("connect");
    let conn = a.connector.connection(0);

    a.engine.teardown().await;
    a.engine.teardown().await;

    assert_eq!(a.track.stops.load(Ordering::SeqCst), 1);
    assert!(!a.track.is_enabled());
    assert_eq!(conn.closes.load(Ordering::SeqCst), 1);

    let room = a.engine.room_snapshot().await;
    assert!(!room.active);
    assert!(room.participants.is_empty());
}

#[tokio::test]
async fn failed_connection_removes_the_participant_without_retry() {
    let a = peer(1, false);
    a.engine.add_participant(UserId(2), "b".into(), false).await;
    a.engine.connect_to(UserId(2)).await.expect("connect");
    let conn = a.connector.connection(0);

    conn.push_state(PeerConnectionState::Failed);

    let engine = a.engine.clone();
    wait_for("participant removed", || {
        let engine = engine.clone();
        async move { engine.room_snapshot().await.participants.is_empty() }
    })
    .await;

    let room = a.engine.room_snapshot().await;
    assert!(!room.active);
    assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    // No replacement connection is created; rejoin is user-initiated.
    assert_eq!(a.connector.count(), 1);
}

#[tokio::test]
async fn denied_microphone_surfaces_permission_error() {
    let a = peer(1, true);
    let err = a.engine.acquire_microphone().await.expect_err("must fail");
    assert!(matches!(err, SyncError::PermissionDenied));
}
