//! Relay connection.
//!
//! The socket itself sits behind [`RelayConnector`] so the room logic can run
//! over any duplex text link. [`SignalingChannel`] parses inbound frames on a
//! reader task and forwards them, in arrival order, to its owner's queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::errors::MeshError;
use crate::protocol::Envelope;

/// Build the relay socket URL for `room`.
///
/// `http` and `ws` origins map to `ws`, `https` and `wss` to `wss`. The name
/// parameter is left out when there is no non-blank name.
pub fn relay_url(base: &str, room: &str, name: Option<&str>) -> Result<Url, MeshError> {
    let mut url = Url::parse(base.trim()).map_err(|e| MeshError::Connection(format!("invalid relay url {base}: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(MeshError::Connection(format!("unsupported relay scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Connection(format!("cannot use {scheme} for {base}")))?;
    url.set_path("/ws");
    url.set_fragment(None);

    let mut query = format!("room={}", urlencoding::encode(room));
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        query.push_str("&name=");
        query.push_str(&urlencoding::encode(name));
    }
    url.set_query(Some(&query));
    Ok(url)
}

/// Outbound frame on a relay link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Close,
}

/// Duplex text link to the relay. The link is closed once `incoming` ends.
pub struct RelayLink {
    pub outgoing: mpsc::UnboundedSender<RelayFrame>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<RelayLink, MeshError>;
}

/// WebSocket link over `tokio-tungstenite`.
pub struct WsConnector;

#[async_trait]
impl RelayConnector for WsConnector {
    async fn open(&self, url: &Url) -> Result<RelayLink, MeshError> {
        tracing::info!("connecting to relay {url}");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| MeshError::Connection(format!("relay connect: {e}")))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let (msg, last) = match frame {
                    RelayFrame::Text(text) => (Message::Text(text), false),
                    RelayFrame::Close => (Message::Close(None), true),
                };
                if let Err(e) = write.send(msg).await {
                    tracing::warn!("relay send failed: {e}");
                    break;
                }
                if last {
                    break;
                }
            }
            tracing::debug!("relay writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::warn!("dropping non-utf8 relay frame"),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("relay read error: {e}");
                        break;
                    }
                }
            }
            tracing::debug!("relay reader finished");
        });

        Ok(RelayLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// What the channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Envelope(Envelope),
    Closed,
}

/// Fire-and-forget send half of the channel, cloned into every peer task.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<RelayFrame>,
    open: Arc<AtomicBool>,
}

impl SignalSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RelayFrame>, open: Arc<AtomicBool>) -> Self {
        Self { tx, open }
    }

    /// A sender that drops everything.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self::new(tx, Arc::new(AtomicBool::new(false)))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue `envelope` for the relay. Returns false when it was dropped
    /// because the channel is not open.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if !self.is_open() {
            tracing::debug!("channel closed, dropping {} frame", envelope.kind());
            return false;
        }
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("cannot encode {} frame: {e}", envelope.kind());
                return false;
            }
        };
        if self.tx.send(RelayFrame::Text(text)).is_err() {
            self.open.store(false, Ordering::SeqCst);
            tracing::debug!("relay writer gone, dropping {} frame", envelope.kind());
            return false;
        }
        true
    }
}

pub struct SignalingChannel {
    sender: SignalSender,
    reader: JoinHandle<()>,
}

impl SignalingChannel {
    /// Open the link and start forwarding parsed envelopes to `events`.
    pub async fn connect(
        connector: &dyn RelayConnector,
        url: &Url,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self, MeshError> {
        let RelayLink { outgoing, mut incoming } = connector.open(url).await?;
        let open = Arc::new(AtomicBool::new(true));
        let sender = SignalSender::new(outgoing, open.clone());

        let reader = tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                match Envelope::parse(&text) {
                    Ok(envelope) => {
                        tracing::trace!("relay -> {}", envelope.kind());
                        if events.send(ChannelEvent::Envelope(envelope)).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!("discarding relay frame: {e}"),
                }
            }
            open.store(false, Ordering::SeqCst);
            tracing::info!("signaling channel closed");
            let _ = events.send(ChannelEvent::Closed);
        });

        Ok(Self { sender, reader })
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Close the link. No [`ChannelEvent::Closed`] follows a local close.
    pub fn close(&self) {
        self.reader.abort();
        if self.sender.open.swap(false, Ordering::SeqCst) {
            let _ = self.sender.tx.send(RelayFrame::Close);
            tracing::info!("signaling channel closed locally");
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryConnector;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("channel event")
            .expect("channel open")
    }

    #[test]
    fn url_maps_scheme_and_encodes_params() {
        let url = relay_url("http://localhost:8080", "team sync", Some("Zoë & co")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws?room=team%20sync&name=Zo%C3%AB%20%26%20co");

        let url = relay_url("https://meet.example.org/some/page", "r1", None).unwrap();
        assert_eq!(url.as_str(), "wss://meet.example.org/ws?room=r1");

        let url = relay_url("wss://relay.example", "r1", Some("   ")).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example/ws?room=r1");
    }

    #[test]
    fn url_rejects_bad_origins() {
        assert!(relay_url("not a url", "r1", None).is_err());
        assert!(relay_url("ftp://example.org", "r1", None).is_err());
    }

    #[tokio::test]
    async fn forwards_envelopes_and_discards_garbage() {
        let connector = MemoryConnector::default();
        let url = relay_url("http://relay", "r1", None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(&connector, &url, tx).await.unwrap();
        let relay = connector.take_relay().unwrap();
        assert_eq!(connector.urls(), vec![url]);

        relay.push(r#"{"type":"welcome","from":"c1"}"#);
        relay.push("{broken");
        relay.push(r#"{"type":"peer-joined","from":"c2"}"#);

        assert_eq!(next_event(&mut rx).await, ChannelEvent::Envelope(Envelope::Welcome { from: "c1".into() }));
        assert_eq!(next_event(&mut rx).await, ChannelEvent::Envelope(Envelope::PeerJoined { from: "c2".into() }));
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn remote_close_is_reported_and_sends_are_dropped() {
        let connector = MemoryConnector::default();
        let url = relay_url("http://relay", "r1", None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(&connector, &url, tx).await.unwrap();
        let sender = channel.sender();
        let mut relay = connector.take_relay().unwrap();

        assert!(sender.send(&Envelope::chat("hi")));
        assert_eq!(relay.next_text().await.as_deref(), Some(r#"{"type":"chat","data":"hi"}"#));

        relay.hang_up();
        assert_eq!(next_event(&mut rx).await, ChannelEvent::Closed);
        assert!(!channel.is_open());
        assert!(!sender.send(&Envelope::chat("late")));
    }

    #[tokio::test]
    async fn local_close_sends_close_frame_once() {
        let connector = MemoryConnector::default();
        let url = relay_url("http://relay", "r1", None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(&connector, &url, tx).await.unwrap();
        let mut relay = connector.take_relay().unwrap();

        channel.close();
        channel.close();
        assert_eq!(relay.next_frame().await, Some(RelayFrame::Close));
        assert!(!channel.sender().send(&Envelope::chat("x")));
        assert_eq!(relay.try_next_frame(), None);
    }

    #[tokio::test]
    async fn open_failure_is_a_connection_error() {
        let connector = MemoryConnector::default();
        connector.fail_next();
        let url = relay_url("http://relay", "r1", None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = SignalingChannel::connect(&connector, &url, tx).await.err().unwrap();
        assert!(matches!(err, MeshError::Connection(_)));
    }

    #[test]
    fn detached_sender_drops_everything() {
        let sender = SignalSender::detached();
        assert!(!sender.is_open());
        assert!(!sender.send(&Envelope::chat("x")));
    }
}
