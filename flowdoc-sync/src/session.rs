//! Real-time collaboration session for one document.
//!
//! ```text
//! send_edit / send_comment / send_cursor
//!       │
//!       ▼
//!  outbox (VecDeque) ──flush when connected & online──► Transport ──► server
//!                                                           │
//!  listeners ◄── dispatch ◄── own echoes skipped ◄── recv ──┘
//! ```
//!
//! Every outgoing event goes through the outbox, so events produced while
//! offline are delivered on reconnect in the order they were produced, and
//! a failed send leaves the event queued for the next flush.
//!
//! A refused connect or a dropped channel is retried with doubling delays
//! once the network is reachable. A failed send schedules up to
//! `max_send_retries` timed flushes before waiting for the next event or
//! reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowdoc_core::{Comment, CommentDraft, Position};

use crate::event::{CollaborationEvent, CollaborationUser, EventChannel, EventData};
use crate::presence::PresenceRoster;
use crate::protocol::SyncMessage;
use crate::reachability::ReachabilityMonitor;
use crate::transport::Transport;

pub type EventHandler = Arc<dyn Fn(&CollaborationEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay before connecting and announcing the local join (default: 1s).
    pub connect_delay: Duration,
    /// Oldest buffered events are discarded beyond this many.
    pub max_buffered_events: usize,
    /// First wait before reconnecting; doubles up to `max_reconnect_delay`.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// First wait before re-flushing after a failed send; doubles per attempt.
    pub send_retry_delay: Duration,
    pub max_send_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_secs(1),
            max_buffered_events: 10_000,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            send_retry_delay: Duration::from_secs(1),
            max_send_retries: 5,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            max_buffered_events: 1_000,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(100),
            send_retry_delay: Duration::from_millis(10),
            max_send_retries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no active collaboration session")]
    NotStarted,
}

#[derive(Default)]
struct SessionInner {
    document_id: Option<Uuid>,
    user: Option<CollaborationUser>,
    connected: bool,
    /// Bumped by every start/stop; background tasks of an older generation
    /// stop acting.
    generation: u64,
    next_seq: u64,
    listeners: HashMap<EventChannel, Vec<EventHandler>>,
    outbox: VecDeque<CollaborationEvent>,
    roster: PresenceRoster,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<SessionInner>,
    transport: Arc<dyn Transport>,
    reachability: ReachabilityMonitor,
    /// Held for the duration of a flush so sends never interleave.
    flush: tokio::sync::Mutex<()>,
    send_failed: Notify,
    config: SessionConfig,
}

/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct CollaborationSession {
    shared: Arc<Shared>,
}

impl CollaborationSession {
    pub fn new(transport: Arc<dyn Transport>, reachability: ReachabilityMonitor, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner::default()),
                transport,
                reachability,
                flush: tokio::sync::Mutex::new(()),
                send_failed: Notify::new(),
                config,
            }),
        }
    }

    /// Join `document_id` as `user`. A running session is stopped first.
    ///
    /// Connection happens in the background after the configured delay;
    /// events sent before then are buffered.
    pub async fn start(&self, document_id: Uuid, user: CollaborationUser) {
        self.stop().await;

        let (generation, join) = {
            let mut inner = self.shared.inner();
            inner.generation += 1;
            inner.document_id = Some(document_id);
            inner.user = Some(user.clone());
            inner.roster.join(user.clone());
            // The announcement is the first event this peer emits.
            let join = CollaborationEvent::new(user.clone(), EventData::Join, 0);
            inner.next_seq = 1;
            inner.outbox.push_back(join.clone());
            (inner.generation, join)
        };
        log::info!("collaboration on {document_id} started as '{}'", user.name);

        let shared = Arc::clone(&self.shared);
        let run = tokio::spawn(async move { shared.run(generation, document_id, join).await });
        let shared = Arc::clone(&self.shared);
        let watcher = tokio::spawn(async move { shared.watch_reachability(generation).await });
        let shared = Arc::clone(&self.shared);
        let retry = tokio::spawn(async move { shared.retry_failed_sends(generation).await });

        let mut inner = self.shared.inner();
        if inner.generation == generation {
            inner.tasks.extend([run, watcher, retry]);
        } else {
            for task in [run, watcher, retry] {
                task.abort();
            }
        }
    }

    /// Leave the document, unregister all listeners and drop buffered
    /// events. Safe to call any number of times.
    pub async fn stop(&self) {
        let (tasks, leave, was_active) = {
            let mut inner = self.shared.inner();
            let was_active = inner.document_id.is_some();
            let leave = match (&inner.user, inner.document_id, inner.connected) {
                (Some(user), Some(doc_id), true) => {
                    let event = CollaborationEvent::new(user.clone(), EventData::Leave, inner.next_seq);
                    SyncMessage::event(doc_id, &event).ok()
                }
                _ => None,
            };

            inner.generation += 1;
            inner.document_id = None;
            inner.user = None;
            inner.connected = false;
            inner.next_seq = 0;
            inner.listeners.clear();
            inner.outbox.clear();
            inner.roster.clear();
            (std::mem::take(&mut inner.tasks), leave, was_active)
        };

        for task in tasks {
            task.abort();
        }
        if !was_active {
            return;
        }
        if let Some(msg) = leave {
            if self.shared.reachability.is_online() {
                if let Err(e) = self.shared.transport.send(msg).await {
                    log::debug!("leave not delivered: {e}");
                }
            }
        }
        self.shared.transport.close().await;
        log::info!("collaboration stopped");
    }

    /// Register a handler. Several handlers per channel are allowed.
    pub fn on(&self, channel: impl Into<EventChannel>, handler: EventHandler) {
        self.shared
            .inner()
            .listeners
            .entry(channel.into())
            .or_default()
            .push(handler);
    }

    /// Remove exactly `handler` from `channel`. Returns `false` if it was
    /// not registered there.
    pub fn off(&self, channel: impl Into<EventChannel>, handler: &EventHandler) -> bool {
        let mut inner = self.shared.inner();
        let Some(handlers) = inner.listeners.get_mut(&channel.into()) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    pub async fn send_edit(
        &self,
        path: impl Into<String>,
        value: Value,
        base_version: u64,
    ) -> Result<CollaborationEvent, SessionError> {
        self.shared
            .emit(EventData::Edit {
                path: path.into(),
                value,
                base_version,
            })
            .await
    }

    /// Publish a comment. The returned comment carries its final id and
    /// timestamp and can be shown right away.
    pub async fn send_comment(&self, draft: CommentDraft) -> Result<Comment, SessionError> {
        let author = self.local_user().ok_or(SessionError::NotStarted)?.as_author();
        let comment = draft.into_comment(author);
        self.shared.emit(EventData::Comment(comment.clone())).await?;
        Ok(comment)
    }

    pub async fn send_cursor(&self, position: Position) -> Result<CollaborationEvent, SessionError> {
        self.shared.emit(EventData::Cursor(position)).await
    }

    pub fn is_active(&self) -> bool {
        self.shared.inner().document_id.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner().connected
    }

    pub fn document_id(&self) -> Option<Uuid> {
        self.shared.inner().document_id
    }

    pub fn local_user(&self) -> Option<CollaborationUser> {
        self.shared.inner().user.clone()
    }

    /// Participants in join order, the local user first.
    pub fn active_users(&self) -> Vec<CollaborationUser> {
        self.shared.inner().roster.active_users()
    }

    /// Drop remote participants not heard from within `timeout`.
    pub fn prune_idle_users(&self, timeout: Duration) -> Vec<Uuid> {
        let mut inner = self.shared.inner();
        let local = inner.user.as_ref().map(|u| u.id);
        let pruned = inner.roster.prune_idle(timeout);
        if let Some(user) = inner.user.clone() {
            inner.roster.join(user);
        }
        pruned.into_iter().filter(|id| Some(*id) != local).collect()
    }

    /// Events waiting to be transmitted.
    pub fn buffered_events(&self) -> Vec<CollaborationEvent> {
        self.shared.inner().outbox.iter().cloned().collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.inner().outbox.len()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.inner().listeners.values().map(Vec::len).sum()
    }
}

fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner().generation == generation
    }

    async fn emit(&self, data: EventData) -> Result<CollaborationEvent, SessionError> {
        let (event, connected, generation) = {
            let mut inner = self.inner();
            let user = inner.user.clone().ok_or(SessionError::NotStarted)?;
            let event = CollaborationEvent::new(user, data, inner.next_seq);
            inner.next_seq += 1;
            inner.outbox.push_back(event.clone());
            if inner.outbox.len() > self.config.max_buffered_events {
                inner.outbox.pop_front();
                log::warn!("collaboration buffer full, discarding oldest event");
            }
            (event, inner.connected, inner.generation)
        };

        if connected && self.reachability.is_online() {
            self.flush_or_retry(generation).await;
        } else {
            log::debug!("offline, buffered {:?} event #{}", event.kind(), event.seq);
        }
        Ok(event)
    }

    /// Send buffered events in order until the outbox is empty or a send
    /// fails. Returns `false` on a failed send.
    async fn flush(&self, generation: u64) -> bool {
        let _flush = self.flush.lock().await;
        loop {
            if !self.reachability.is_online() {
                return true;
            }
            let (event, doc_id) = {
                let inner = self.inner();
                if inner.generation != generation || !inner.connected {
                    return true;
                }
                match (inner.outbox.front(), inner.document_id) {
                    (Some(event), Some(doc_id)) => (event.clone(), doc_id),
                    _ => return true,
                }
            };

            let sent = match SyncMessage::event(doc_id, &event) {
                Ok(msg) => match self.transport.send(msg).await {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("send failed, keeping {} event(s) buffered: {e}", self.inner().outbox.len());
                        return false;
                    }
                },
                Err(e) => {
                    log::warn!("discarding unencodable event #{}: {e}", event.seq);
                    false
                }
            };

            let mut inner = self.inner();
            if inner.generation == generation && inner.outbox.front().map(|e| e.seq) == Some(event.seq) {
                inner.outbox.pop_front();
            }
            if sent {
                log::debug!("sent {:?} event #{}", event.kind(), event.seq);
            }
        }
    }

    /// Connect, announce the local join, flush, then pump inbound messages.
    /// A refused connect or a closed channel is retried, once reachable,
    /// for as long as this generation is current.
    async fn run(&self, generation: u64, doc_id: Uuid, join: CollaborationEvent) {
        tokio::time::sleep(self.config.connect_delay).await;
        let mut announced = false;
        let mut delay = self.config.reconnect_delay;

        while self.is_current(generation) {
            if let Err(e) = self.transport.connect(doc_id).await {
                log::warn!("collaboration connect failed, retrying in {delay:?}: {e}");
                self.backoff(&mut delay).await;
                continue;
            }
            {
                let mut inner = self.inner();
                if inner.generation != generation {
                    return;
                }
                inner.connected = true;
            }
            delay = self.config.reconnect_delay;
            if !announced {
                self.dispatch(&join);
                announced = true;
            }
            self.flush_or_retry(generation).await;

            while let Some(msg) = self.transport.recv().await {
                if !self.is_current(generation) {
                    return;
                }
                self.handle_incoming(msg, doc_id);
            }

            {
                let mut inner = self.inner();
                if inner.generation != generation {
                    return;
                }
                inner.connected = false;
            }
            log::info!("collaboration channel closed, reconnecting in {delay:?}");
            self.backoff(&mut delay).await;
        }
    }

    /// Sleep for `delay`, double it up to the cap, then wait until the
    /// network is reachable.
    async fn backoff(&self, delay: &mut Duration) {
        tokio::time::sleep(*delay).await;
        *delay = (*delay * 2).min(self.config.max_reconnect_delay);
        let mut rx = self.reachability.subscribe();
        if rx.wait_for(|online| *online).await.is_err() {
            log::debug!("reachability monitor dropped");
        }
    }

    async fn flush_or_retry(&self, generation: u64) {
        if !self.flush(generation).await {
            self.send_failed.notify_one();
        }
    }

    /// Re-flush after a failed send with doubling delays, giving up after
    /// `max_send_retries` attempts until the next failure.
    async fn retry_failed_sends(&self, generation: u64) {
        loop {
            self.send_failed.notified().await;
            let mut delay = self.config.send_retry_delay;
            for attempt in 1..=self.config.max_send_retries {
                tokio::time::sleep(delay).await;
                if !self.is_current(generation) {
                    return;
                }
                if self.flush(generation).await {
                    break;
                }
                if attempt == self.config.max_send_retries {
                    log::warn!("giving up timed resends after {attempt} attempt(s)");
                }
                delay *= 2;
            }
        }
    }

    async fn watch_reachability(&self, generation: u64) {
        let mut rx = self.reachability.subscribe();
        loop {
            if rx.changed().await.is_err() || !self.is_current(generation) {
                return;
            }
            let online = *rx.borrow_and_update();
            if online {
                self.flush_or_retry(generation).await;
            }
        }
    }

    fn handle_incoming(&self, msg: SyncMessage, doc_id: Uuid) {
        if msg.doc_id != doc_id || !msg.is_event() {
            return;
        }
        let event = match msg.to_event() {
            Ok(event) => event,
            Err(e) => {
                log::warn!("ignoring undecodable event from {}: {e}", msg.peer_id);
                return;
            }
        };

        {
            let mut inner = self.inner();
            if inner.user.as_ref().map(|u| u.id) == Some(event.user.id) {
                return;
            }
            inner.roster.observe(&event);
        }
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &CollaborationEvent) {
        let handlers: Vec<EventHandler> = {
            let inner = self.inner();
            let specific = inner.listeners.get(&EventChannel::Kind(event.kind()));
            let wildcard = inner.listeners.get(&EventChannel::All);
            specific
                .into_iter()
                .chain(wildcard)
                .flatten()
                .cloned()
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }
}
