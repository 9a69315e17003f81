//! Message transports for collaboration traffic.
//!
//! - [`WebSocketTransport`] talks to the sync server over tokio-tungstenite.
//! - [`LoopbackTransport`] keeps everything in memory: sent messages are
//!   recorded, inbound messages are injected by the caller.
//!
//! Both carry [`SyncMessage`] envelopes; the session above decides what to
//! send and when.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::event::CollaborationEvent;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::queue::{RemoteAuthority, SyncQueueItem};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel for one document.
    async fn connect(&self, doc_id: Uuid) -> Result<(), TransportError>;

    async fn send(&self, msg: SyncMessage) -> Result<(), TransportError>;

    /// Next inbound message; `None` once the connection is gone.
    async fn recv(&self) -> Option<SyncMessage>;

    async fn close(&self);

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── WebSocket ────────────────────────────────────────────────────────

pub struct WebSocketTransport {
    server_url: String,
    state: Arc<Mutex<ConnectionState>>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    incoming: tokio::sync::Mutex<Option<mpsc::Receiver<SyncMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            outgoing: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, doc_id: Uuid) -> Result<(), TransportError> {
        self.abort_tasks();
        self.set_state(ConnectionState::Connecting);

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), doc_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(TransportError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(256);

        let state = Arc::clone(&self.state);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
            *lock(&state) = ConnectionState::Disconnected;
        });

        let state = Arc::clone(&self.state);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if in_tx.send(sync_msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("dropping malformed frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("connection to sync server lost");
            *lock(&state) = ConnectionState::Disconnected;
        });

        *lock(&self.outgoing) = Some(out_tx);
        *self.incoming.lock().await = Some(in_rx);
        lock(&self.tasks).extend([writer, reader]);
        self.set_state(ConnectionState::Connected);
        log::info!("connected to {url}");
        Ok(())
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let encoded = msg.encode()?;
        let tx = lock(&self.outgoing).clone().ok_or(TransportError::NotConnected)?;
        tx.send(encoded).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<SyncMessage> {
        let mut incoming = self.incoming.lock().await;
        incoming.as_mut()?.recv().await
    }

    async fn close(&self) {
        // Dropping the sender lets the writer flush and close the socket.
        lock(&self.outgoing).take();
        if let Some(reader) = lock(&self.tasks).pop() {
            reader.abort();
        }
        self.incoming.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }
}

// ─── Loopback ─────────────────────────────────────────────────────────

/// In-memory transport.
///
/// Every sent message goes through the wire codec and is recorded. With
/// `echo` enabled, sent messages are also delivered back inbound, the way a
/// relay server fans a message out to every peer including its sender.
pub struct LoopbackTransport {
    state: Mutex<ConnectionState>,
    echo: bool,
    fail_sends: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicU64,
    sent: Mutex<Vec<SyncMessage>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<SyncMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SyncMessage>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            echo: false,
            fail_sends: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn with_echo() -> Self {
        Self {
            echo: true,
            ..Self::new()
        }
    }

    /// Make sends fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Deliver a message as if it came from the server. Returns `false`
    /// once the transport has been closed.
    pub fn inject(&self, msg: SyncMessage) -> bool {
        match lock(&self.inbound_tx).as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Deliver a collaboration event from a remote peer.
    pub fn inject_event(&self, doc_id: Uuid, event: &CollaborationEvent) -> Result<bool, ProtocolError> {
        Ok(self.inject(SyncMessage::event(doc_id, event)?))
    }

    pub fn sent(&self) -> Vec<SyncMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self, msg_type: MessageType) -> usize {
        lock(&self.sent).iter().filter(|m| m.msg_type == msg_type).count()
    }

    /// Sent collaboration events, in send order.
    pub fn sent_events(&self) -> Vec<CollaborationEvent> {
        lock(&self.sent).iter().filter_map(|m| m.to_event().ok()).collect()
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _doc_id: Uuid) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("loopback refused".into()));
        }
        let closed = lock(&self.inbound_tx).is_none();
        if closed {
            let (new_tx, new_rx) = mpsc::unbounded_channel();
            *self.inbound_rx.lock().await = new_rx;
            *lock(&self.inbound_tx) = Some(new_tx);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Connected;
        Ok(())
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("loopback send failure".into()));
        }
        let wire = SyncMessage::decode(&msg.encode()?)?;
        lock(&self.sent).push(wire.clone());
        if self.echo {
            self.inject(wire);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<SyncMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        lock(&self.inbound_tx).take();
        *lock(&self.state) = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }
}

/// Pushes queue items to the sync server as `Mutation` envelopes.
pub struct TransportAuthority {
    transport: Arc<dyn Transport>,
    peer_id: Uuid,
}

impl TransportAuthority {
    pub fn new(transport: Arc<dyn Transport>, peer_id: Uuid) -> Self {
        Self { transport, peer_id }
    }
}

#[async_trait]
impl RemoteAuthority for TransportAuthority {
    async fn push(&self, item: &SyncQueueItem) -> Result<(), TransportError> {
        let msg = SyncMessage::mutation(self.peer_id, item)?;
        self.transport.send(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CollaborationUser, EventData};
    use crate::queue::{SyncAction, SyncPayload};

    #[tokio::test]
    async fn test_loopback_requires_connect() {
        let transport = LoopbackTransport::new();
        let err = transport.send(SyncMessage::ping(Uuid::new_v4())).await;
        assert_eq!(err, Err(TransportError::NotConnected));

        transport.connect(Uuid::new_v4()).await.unwrap();
        transport.send(SyncMessage::ping(Uuid::new_v4())).await.unwrap();
        assert_eq!(transport.sent_count(MessageType::Ping), 1);
    }

    #[tokio::test]
    async fn test_loopback_inject_and_recv() {
        let transport = LoopbackTransport::new();
        transport.connect(Uuid::new_v4()).await.unwrap();

        let doc = Uuid::new_v4();
        let event = CollaborationEvent::new(CollaborationUser::new("Remote", None), EventData::Join, 0);
        assert!(transport.inject_event(doc, &event).unwrap());

        let msg = transport.recv().await.unwrap();
        assert_eq!(msg.to_event().unwrap(), event);
    }

    #[tokio::test]
    async fn test_loopback_close_ends_recv_and_reconnects() {
        let transport = LoopbackTransport::new();
        transport.connect(Uuid::new_v4()).await.unwrap();
        transport.close().await;

        assert!(transport.recv().await.is_none());
        assert!(!transport.inject(SyncMessage::ping(Uuid::nil())));

        transport.connect(Uuid::new_v4()).await.unwrap();
        assert!(transport.inject(SyncMessage::ping(Uuid::nil())));
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_loopback_echo() {
        let transport = LoopbackTransport::with_echo();
        transport.connect(Uuid::new_v4()).await.unwrap();
        transport.send(SyncMessage::ping(Uuid::nil())).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().msg_type, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_transport_authority_sends_mutation() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.connect(Uuid::new_v4()).await.unwrap();
        let authority = TransportAuthority::new(transport.clone(), Uuid::new_v4());

        let record = Uuid::new_v4();
        let item = SyncQueueItem::new(record, SyncAction::Delete, SyncPayload::Tombstone, 0);
        authority.push(&item).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_mutation().unwrap().record_id, record);

        transport.set_fail_sends(true);
        assert!(authority.push(&item).await.is_err());
    }

    #[tokio::test]
    async fn test_websocket_connect_failure() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1");
        let result = transport.connect(Uuid::new_v4()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.recv().await.is_none());
    }
}
