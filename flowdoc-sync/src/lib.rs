//! # flowdoc-sync — offline persistence and sync for FlowDoc
//!
//! Keeps workflow submissions usable without a network and reconciles them
//! with the server and with other editors once one is available.
//!
//! ## Architecture
//!
//! ```text
//!  local mutation ──► DurableStore (RocksDB / memory)
//!        │
//!        └──────────► SyncQueue ──drain──► RemoteAuthority
//!                        ▲
//!  ReachabilityMonitor ──┘ (once per reconnect, after settling)
//!
//!  CollaborationSession ◄──► Transport (WebSocket / loopback) ◄──► peers
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — namespaced key-value persistence with bincode + LZ4 values
//! - [`queue`] — coalescing outbound mutation queue with bounded retries
//! - [`reachability`] — online/offline state and reconnect triggers
//! - [`protocol`] — bincode wire envelope
//! - [`transport`] — WebSocket and in-memory transports
//! - [`session`] — per-document collaboration with offline buffering
//! - [`presence`] — participant roster and colors
//! - [`event`] — collaboration event types

pub mod event;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod reachability;
pub mod session;
pub mod storage;
pub mod transport;

pub use event::{CollaborationEvent, CollaborationUser, EventChannel, EventData, EventKind};
pub use presence::{color_for, PresenceRoster, PALETTE};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use queue::{
    DrainReport, QueueConfig, RecordingAuthority, RemoteAuthority, SimulatedAuthority, SyncAction,
    SyncPayload, SyncQueue, SyncQueueItem, MAX_RETRIES,
};
pub use reachability::{HealthCheck, ReachabilityConfig, ReachabilityMonitor};
pub use session::{CollaborationSession, EventHandler, SessionConfig, SessionError};
pub use storage::{
    DurableStore, KeyValueBackend, MemoryBackend, Namespace, RecoveryReport, RocksBackend,
    RocksConfig, StoreError, StoreKey,
};
pub use transport::{
    ConnectionState, LoopbackTransport, Transport, TransportAuthority, TransportError,
    WebSocketTransport,
};
