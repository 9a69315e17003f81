//! Outbound mutation queue.
//!
//! Every local create/update/delete of a submission is recorded here and
//! mirrored into the durable store so it survives restarts. A drain pushes
//! pending items to the [`RemoteAuthority`] oldest first.
//!
//! ## Coalescing
//!
//! | newest pending for record | enqueued | result                       |
//! |---------------------------|----------|------------------------------|
//! | create                    | create   | payload replaced             |
//! | create                    | update   | folded into the create       |
//! | update                    | update   | payload replaced             |
//! | delete                    | delete   | payload replaced             |
//! | anything else             |          | new entry                    |
//!
//! A delete is never absorbed into an earlier entry, and nothing is
//! absorbed into a delete.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowdoc_core::{NotificationCenter, NotificationKind, WorkflowSubmission};

use crate::reachability::ReachabilityMonitor;
use crate::storage::DurableStore;
use crate::transport::TransportError;

/// Failed transmissions tolerated before an item is dropped.
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncPayload {
    Submission(Box<WorkflowSubmission>),
    /// Deletes carry only the record id.
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub record_id: Uuid,
    pub action: SyncAction,
    pub payload: SyncPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Tie-breaker for items enqueued within the same clock tick.
    pub seq: u64,
    pub retry_count: u32,
    /// Bumped whenever the payload is replaced by coalescing.
    pub revision: u32,
}

impl SyncQueueItem {
    pub fn new(record_id: Uuid, action: SyncAction, payload: SyncPayload, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            action,
            payload,
            enqueued_at: Utc::now(),
            seq,
            retry_count: 0,
            revision: 0,
        }
    }

    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.enqueued_at, self.seq)
    }
}

/// The server side of synchronization.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn push(&self, item: &SyncQueueItem) -> Result<(), TransportError>;
}

/// Accepts everything after a fixed latency. Stands in for a backend
/// during local-only use.
#[derive(Debug, Clone)]
pub struct SimulatedAuthority {
    pub latency: Duration,
}

impl Default for SimulatedAuthority {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl RemoteAuthority for SimulatedAuthority {
    async fn push(&self, item: &SyncQueueItem) -> Result<(), TransportError> {
        tokio::time::sleep(self.latency).await;
        log::debug!("simulated push of {:?} for {}", item.action, item.record_id);
        Ok(())
    }
}

/// Records every push; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingAuthority {
    pushed: Mutex<Vec<SyncQueueItem>>,
    failing: AtomicBool,
    attempts: AtomicU64,
}

impl RecordingAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successfully pushed items, in push order.
    pub fn pushed(&self) -> Vec<SyncQueueItem> {
        self.pushed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// All attempts, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAuthority for RecordingAuthority {
    async fn push(&self, item: &SyncQueueItem) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Send("remote rejected the mutation".into()));
        }
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_retries: u32,
    /// Interval of the background drain (default: 5 minutes).
    pub periodic_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            periodic_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl QueueConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            periodic_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of one [`SyncQueue::drain`], over all of its passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
    pub sent: Vec<Uuid>,
    pub retried: Vec<Uuid>,
    pub dropped: Vec<Uuid>,
    /// Held back behind an earlier failure (or a mid-flight payload change)
    /// for the same record.
    pub deferred: Vec<Uuid>,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Clears the in-flight flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncQueue {
    items: Mutex<Vec<SyncQueueItem>>,
    next_seq: AtomicU64,
    draining: AtomicBool,
    /// Set by a drain that found another one running.
    rerun: AtomicBool,
    /// Serializes store mirroring so writes land in mutation order.
    persist: tokio::sync::Mutex<()>,
    store: DurableStore,
    authority: Arc<dyn RemoteAuthority>,
    notifications: Arc<NotificationCenter>,
    config: QueueConfig,
}

impl SyncQueue {
    pub fn new(
        store: DurableStore,
        authority: Arc<dyn RemoteAuthority>,
        notifications: Arc<NotificationCenter>,
        config: QueueConfig,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            persist: tokio::sync::Mutex::new(()),
            store,
            authority,
            notifications,
            config,
        }
    }

    fn items(&self) -> MutexGuard<'_, Vec<SyncQueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload pending items from the durable store. Returns how many.
    pub async fn restore(&self) -> usize {
        let mut restored = self.store.load_sync_items().await;
        restored.sort_by_key(SyncQueueItem::order_key);
        let next = restored.iter().map(|i| i.seq + 1).max().unwrap_or(0);
        self.next_seq.fetch_max(next, Ordering::SeqCst);

        let count = restored.len();
        *self.items() = restored;
        if count > 0 {
            log::info!("restored {count} pending sync item(s)");
        }
        count
    }

    /// Record a mutation, coalescing with the newest pending entry for the
    /// same record where that is safe. Returns the id of the entry holding
    /// the mutation.
    pub async fn enqueue(&self, record_id: Uuid, action: SyncAction, payload: SyncPayload) -> Uuid {
        let _persist = self.persist.lock().await;

        let item = {
            let mut items = self.items();
            let newest = items.iter().rposition(|i| i.record_id == record_id);
            match newest {
                Some(pos) if Self::absorbs(items[pos].action, action) => {
                    let existing = &mut items[pos];
                    existing.payload = payload;
                    existing.revision += 1;
                    log::debug!(
                        "coalesced {action:?} for {record_id} into {:?} {}",
                        existing.action,
                        existing.id
                    );
                    existing.clone()
                }
                _ => {
                    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                    let item = SyncQueueItem::new(record_id, action, payload, seq);
                    items.push(item.clone());
                    log::debug!("queued {action:?} for {record_id} as {}", item.id);
                    item
                }
            }
        };

        self.store.put_sync_item(&item).await;
        item.id
    }

    fn absorbs(pending: SyncAction, incoming: SyncAction) -> bool {
        pending == incoming || (pending == SyncAction::Create && incoming == SyncAction::Update)
    }

    /// Push pending items oldest first.
    ///
    /// Only one drain runs at a time; a concurrent call returns a report
    /// with `skipped` set and makes the running drain take another pass, so
    /// items enqueued meanwhile are not left behind. Records that failed
    /// stay blocked for the rest of the drain.
    pub async fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            log::debug!("drain already in flight");
            self.rerun.store(true, Ordering::SeqCst);
            return DrainReport::skipped();
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        let mut failed: HashSet<Uuid> = HashSet::new();
        loop {
            self.drain_pass(&mut report, &mut failed).await;
            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            log::debug!("drain requested mid-flight, taking another pass");
        }

        if !report.sent.is_empty() || !report.dropped.is_empty() {
            log::info!(
                "drain: {} sent, {} retrying, {} dropped, {} deferred",
                report.sent.len(),
                report.retried.len(),
                report.dropped.len(),
                report.deferred.len()
            );
        }
        report
    }

    /// Start a background drain if the network is up.
    pub fn drain_if_online(self: &Arc<Self>, reachability: &ReachabilityMonitor) -> Option<JoinHandle<DrainReport>> {
        if !reachability.is_online() || self.is_empty() {
            return None;
        }
        let queue = Arc::clone(self);
        Some(tokio::spawn(async move { queue.drain().await }))
    }

    async fn drain_pass(&self, report: &mut DrainReport, failed: &mut HashSet<Uuid>) {
        let mut batch = self.items().clone();
        batch.sort_by_key(SyncQueueItem::order_key);
        let mut blocked = failed.clone();

        for item in batch {
            if blocked.contains(&item.record_id) {
                if !report.deferred.contains(&item.id) {
                    report.deferred.push(item.id);
                }
                continue;
            }

            match self.authority.push(&item).await {
                Ok(()) => {
                    report.sent.push(item.id);
                    if !self.complete(&item).await {
                        // Payload replaced mid-flight; the newer revision
                        // goes out before anything later for this record.
                        blocked.insert(item.record_id);
                    }
                }
                Err(e) => {
                    log::warn!("sync of {:?} for {} failed: {e}", item.action, item.record_id);
                    blocked.insert(item.record_id);
                    failed.insert(item.record_id);
                    if self.record_failure(&item).await {
                        report.dropped.push(item.id);
                    } else {
                        report.retried.push(item.id);
                    }
                }
            }
        }
    }

    /// Remove a transmitted item unless its payload changed meanwhile.
    /// Returns `false` if the item stays queued.
    ///
    /// A create that was updated in flight now exists remotely, so what
    /// remains is sent as an update.
    async fn complete(&self, sent: &SyncQueueItem) -> bool {
        let _persist = self.persist.lock().await;
        let remaining = {
            let mut items = self.items();
            match items.iter().position(|i| i.id == sent.id) {
                Some(pos) if items[pos].revision == sent.revision => {
                    items.remove(pos);
                    None
                }
                Some(pos) => {
                    let item = &mut items[pos];
                    if sent.action == SyncAction::Create {
                        item.action = SyncAction::Update;
                    }
                    Some(item.clone())
                }
                None => None,
            }
        };
        match remaining {
            Some(item) => {
                log::debug!("{} changed in flight, keeping it as {:?}", item.id, item.action);
                self.store.put_sync_item(&item).await;
                false
            }
            None => {
                self.store.delete_sync_item(sent.id).await;
                true
            }
        }
    }

    /// Bump the retry count. Returns `true` if the item hit the ceiling and
    /// was dropped.
    async fn record_failure(&self, failed: &SyncQueueItem) -> bool {
        let _persist = self.persist.lock().await;
        let outcome = {
            let mut items = self.items();
            match items.iter().position(|i| i.id == failed.id) {
                Some(pos) => {
                    items[pos].retry_count += 1;
                    if items[pos].retry_count >= self.config.max_retries {
                        Some((true, items.remove(pos)))
                    } else {
                        Some((false, items[pos].clone()))
                    }
                }
                None => None,
            }
        };

        match outcome {
            Some((true, dropped)) => {
                self.store.delete_sync_item(dropped.id).await;
                log::warn!(
                    "dropping {:?} for {} after {} attempts",
                    dropped.action,
                    dropped.record_id,
                    dropped.retry_count
                );
                self.notifications.add(
                    NotificationKind::Error,
                    "Sync failed",
                    format!(
                        "Changes to {} could not be synchronized after {} attempts.",
                        Self::describe(&dropped),
                        dropped.retry_count
                    ),
                    None,
                );
                true
            }
            Some((false, updated)) => {
                self.store.put_sync_item(&updated).await;
                false
            }
            None => false,
        }
    }

    fn describe(item: &SyncQueueItem) -> String {
        match &item.payload {
            SyncPayload::Submission(s) if !s.name.is_empty() => format!("\"{}\"", s.name),
            _ => format!("workflow {}", item.record_id),
        }
    }

    /// Pending items, oldest first.
    pub fn pending(&self) -> Vec<SyncQueueItem> {
        let mut items = self.items().clone();
        items.sort_by_key(SyncQueueItem::order_key);
        items
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Background drain on a fixed interval, skipped while offline.
    pub fn spawn_periodic(self: &Arc<Self>, reachability: ReachabilityMonitor) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let period = self.config.periodic_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if reachability.is_online() && !queue.is_empty() {
                    queue.drain().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(authority: Arc<RecordingAuthority>) -> (SyncQueue, Arc<NotificationCenter>, DurableStore) {
        let notifications = Arc::new(NotificationCenter::new());
        let store = DurableStore::in_memory();
        let queue = SyncQueue::new(store.clone(), authority, notifications.clone(), QueueConfig::for_testing());
        (queue, notifications, store)
    }

    fn payload(name: &str) -> SyncPayload {
        SyncPayload::Submission(Box::new(WorkflowSubmission::new(name, "Acme", "Ops")))
    }

    #[tokio::test]
    async fn test_same_action_coalesces() {
        let (queue, _, _) = queue_with(Arc::new(RecordingAuthority::new()));
        let record = Uuid::new_v4();

        let a = queue.enqueue(record, SyncAction::Update, payload("v1")).await;
        let b = queue.enqueue(record, SyncAction::Update, payload("v2")).await;

        assert_eq!(a, b);
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].revision, 1);
        assert!(matches!(&pending[0].payload, SyncPayload::Submission(s) if s.name == "v2"));
    }

    #[tokio::test]
    async fn test_update_folds_into_create() {
        let (queue, _, _) = queue_with(Arc::new(RecordingAuthority::new()));
        let record = Uuid::new_v4();

        queue.enqueue(record, SyncAction::Create, payload("draft")).await;
        queue.enqueue(record, SyncAction::Update, payload("edited")).await;

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, SyncAction::Create);
    }

    #[tokio::test]
    async fn test_delete_is_never_absorbed() {
        let (queue, _, _) = queue_with(Arc::new(RecordingAuthority::new()));
        let record = Uuid::new_v4();

        queue.enqueue(record, SyncAction::Create, payload("x")).await;
        queue.enqueue(record, SyncAction::Delete, SyncPayload::Tombstone).await;
        queue.enqueue(record, SyncAction::Update, payload("y")).await;

        let actions: Vec<_> = queue.pending().iter().map(|i| i.action).collect();
        assert_eq!(actions, vec![SyncAction::Create, SyncAction::Delete, SyncAction::Update]);
    }

    #[tokio::test]
    async fn test_queue_is_mirrored_to_store() {
        let (queue, _, store) = queue_with(Arc::new(RecordingAuthority::new()));
        queue.enqueue(Uuid::new_v4(), SyncAction::Create, payload("a")).await;
        assert_eq!(store.load_sync_items().await.len(), 1);

        queue.drain().await;
        assert!(store.load_sync_items().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_defers_later_items_for_same_record() {
        let authority = Arc::new(RecordingAuthority::new());
        let (queue, _, _) = queue_with(authority.clone());
        let record = Uuid::new_v4();

        queue.enqueue(record, SyncAction::Create, payload("a")).await;
        queue.enqueue(record, SyncAction::Delete, SyncPayload::Tombstone).await;

        authority.set_failing(true);
        let report = queue.drain().await;
        assert_eq!(report.retried.len(), 1);
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(authority.attempts(), 1);
        assert_eq!(queue.pending()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let (queue, _, _) = queue_with(Arc::new(RecordingAuthority::new()));
        queue.draining.store(true, Ordering::SeqCst);
        assert!(queue.drain().await.skipped);

        queue.draining.store(false, Ordering::SeqCst);
        assert!(!queue.drain().await.skipped);
        assert!(!queue.is_draining());
    }
}
