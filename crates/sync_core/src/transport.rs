use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{net::TcpStream, sync::broadcast, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

/// What the controller observes from the live channel: decoded server
/// events plus connectivity edges.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Server(ServerEvent),
    ConnectionLost,
}

#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn submit(&self, request: ClientRequest) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
    fn is_connected(&self) -> bool;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Persistent bidirectional event transport over a WebSocket. Malformed
/// frames are logged and dropped; they never tear down the session view.
pub struct WebSocketChannel {
    writer: Mutex<WsSink>,
    events: broadcast::Sender<ChannelEvent>,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl WebSocketChannel {
    pub async fn connect(server_url: &str, user_id: UserId) -> Result<Arc<Self>> {
        let ws_url = derive_ws_url(server_url, user_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (writer, mut reader) = ws_stream.split();

        let (events, _) = broadcast::channel(1024);
        let connected = Arc::new(AtomicBool::new(true));

        let reader_events = events.clone();
        let reader_connected = Arc::clone(&connected);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = reader_events.send(ChannelEvent::Server(event));
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping malformed live-channel frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "live channel receive failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let _ = reader_events.send(ChannelEvent::ConnectionLost);
            info!("live channel closed");
        });

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            events,
            connected,
            reader_task,
        }))
    }

    pub fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader_task.abort();
    }
}

#[async_trait]
impl LiveChannel for WebSocketChannel {
    async fn submit(&self, request: ClientRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("live channel is down"));
        }
        let frame = serde_json::to_string(&request)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(frame)).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn derive_ws_url(server_url: &str, user_id: UserId) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("server url must be http(s), got {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to set websocket scheme"))?;
    url.set_path("/ws");
    url.set_query(Some(&format!("user_id={}", user_id.0)));
    Ok(url)
}

/// Null transport used before login and in tests that only exercise the
/// HTTP path. Submitting always fails; `is_connected` is false, which sends
/// outbound messages straight to the HTTP fallback.
pub struct MissingLiveChannel {
    events: broadcast::Sender<ChannelEvent>,
}

impl MissingLiveChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(8);
        Self { events }
    }
}

impl Default for MissingLiveChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveChannel for MissingLiveChannel {
    async fn submit(&self, _request: ClientRequest) -> Result<()> {
        Err(anyhow!("live channel is unavailable"))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        false
    }
}
