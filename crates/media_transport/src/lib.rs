//! Capability traits over the platform peer-connection and capture stack.
//! The synchronization core negotiates against these; the embedding
//! application supplies the platform implementation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Public reflexive-address servers used for connectivity negotiation when
/// the embedder does not configure its own.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

impl IceServer {
    pub fn default_servers() -> Vec<IceServer> {
        vec![IceServer {
            urls: DEFAULT_STUN_URLS.iter().map(|s| (*s).to_string()).collect(),
        }]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    ConnectionStateChanged(PeerConnectionState),
    /// Locally gathered candidate to be relayed to the remote peer.
    IceCandidate(IceCandidate),
    /// Voice-activity signal derived from the remote audio track.
    RemoteAudioActivity { speaking: bool },
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no capture device available")]
    DeviceUnavailable,
    #[error("media backend failure: {0}")]
    Backend(String),
}

pub trait LocalAudioTrack: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Releases the underlying capture device. Idempotent.
    fn stop(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn attach_local_audio(&self, track: Arc<dyn LocalAudioTrack>) -> anyhow::Result<()>;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquires the single exclusively-owned microphone track. Callers must
    /// release it by dropping every handle on room leave or teardown.
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalAudioTrack>, MediaError>;
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn create_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Err(anyhow::anyhow!("peer connection backend is unavailable"))
    }
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalAudioTrack>, MediaError> {
        Err(MediaError::DeviceUnavailable)
    }
}
