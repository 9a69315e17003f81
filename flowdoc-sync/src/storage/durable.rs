//! Typed, failure-absorbing facade over a [`KeyValueBackend`].
//!
//! Ordinary I/O failures are logged and reported as `false` / `None` so
//! callers can carry on optimistically; nothing here panics or returns an
//! error to the UI.

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use flowdoc_core::{IntegrationConfig, UserProfile, WorkflowSubmission};

use super::{decode_value, encode_value, KeyValueBackend, MemoryBackend, Namespace, StoreKey};
use crate::queue::{SyncPayload, SyncQueueItem};

#[derive(Clone)]
pub struct DurableStore {
    backend: Arc<dyn KeyValueBackend>,
}

/// Result of [`DurableStore::recovery_sweep`]. Nothing is repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Saved workflows with no pending queue entry.
    pub unqueued_workflows: Vec<Uuid>,
    /// Queue entries for create/update whose workflow is not stored.
    pub orphaned_queue_items: Vec<Uuid>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_queue_items.is_empty()
    }
}

impl DurableStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Returns `false` if the value could not be encoded or written.
    pub async fn put<T: Serialize + Sync>(&self, key: &StoreKey, value: &T) -> bool {
        let bytes = match encode_value(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("store: cannot encode {key}: {e}");
                return false;
            }
        };
        match self.backend.put(key, bytes).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("store: write {key} failed: {e}");
                false
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &StoreKey) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match decode_value(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("store: cannot decode {key}: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("store: read {key} failed: {e}");
                None
            }
        }
    }

    pub async fn delete(&self, key: &StoreKey) -> bool {
        match self.backend.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("store: delete {key} failed: {e}");
                false
            }
        }
    }

    /// Visit every decodable value in a namespace. Entries that fail to
    /// decode are skipped with a warning.
    pub async fn for_each<T, F>(&self, namespace: Namespace, mut visitor: F)
    where
        T: DeserializeOwned,
        F: FnMut(StoreKey, T),
    {
        let entries = match self.backend.entries(namespace).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("store: scan of '{}' failed: {e}", namespace.as_str());
                return;
            }
        };
        for (key, bytes) in entries {
            match decode_value(&bytes) {
                Ok(value) => visitor(key, value),
                Err(e) => log::warn!("store: skipping {key}: {e}"),
            }
        }
    }

    pub async fn clear(&self) -> bool {
        match self.backend.clear().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("store: clear failed: {e}");
                false
            }
        }
    }

    pub async fn save_workflow(&self, submission: &WorkflowSubmission) -> bool {
        self.put(&StoreKey::workflow(submission.id), submission).await
    }

    pub async fn load_workflow(&self, id: Uuid) -> Option<WorkflowSubmission> {
        self.get(&StoreKey::workflow(id)).await
    }

    pub async fn delete_workflow(&self, id: Uuid) -> bool {
        self.delete(&StoreKey::workflow(id)).await
    }

    /// All stored submissions, oldest first.
    pub async fn load_workflows(&self) -> Vec<WorkflowSubmission> {
        let mut out: Vec<WorkflowSubmission> = Vec::new();
        self.for_each(Namespace::Workflows, |_, s| out.push(s)).await;
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub async fn save_profile(&self, profile: &UserProfile) -> bool {
        self.put(&StoreKey::user_profile(), profile).await
    }

    pub async fn load_profile(&self) -> Option<UserProfile> {
        self.get(&StoreKey::user_profile()).await
    }

    pub async fn save_integration(&self, integration: &IntegrationConfig) -> bool {
        self.put(&StoreKey::integration(integration.id), integration).await
    }

    pub async fn delete_integration(&self, id: Uuid) -> bool {
        self.delete(&StoreKey::integration(id)).await
    }

    /// All stored integrations, by name.
    pub async fn load_integrations(&self) -> Vec<IntegrationConfig> {
        let mut out: Vec<IntegrationConfig> = Vec::new();
        self.for_each(Namespace::Integrations, |_, i| out.push(i)).await;
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn put_sync_item(&self, item: &SyncQueueItem) -> bool {
        self.put(&StoreKey::sync_item(item.id), item).await
    }

    pub async fn delete_sync_item(&self, id: Uuid) -> bool {
        self.delete(&StoreKey::sync_item(id)).await
    }

    pub async fn load_sync_items(&self) -> Vec<SyncQueueItem> {
        let mut out = Vec::new();
        self.for_each(Namespace::SyncQueue, |_, item| out.push(item)).await;
        out
    }

    /// Cross-check workflows against the queue after an unclean shutdown.
    ///
    /// A workflow write and its queue entry are two separate writes; a
    /// crash between them leaves one without the other.
    pub async fn recovery_sweep(&self) -> RecoveryReport {
        let mut workflow_ids = HashSet::new();
        self.for_each(Namespace::Workflows, |key, _: WorkflowSubmission| {
            if let Some(id) = key.uuid() {
                workflow_ids.insert(id);
            }
        })
        .await;

        let items = self.load_sync_items().await;
        let queued: HashSet<Uuid> = items.iter().map(|i| i.record_id).collect();

        let mut report = RecoveryReport::default();
        for item in &items {
            let needs_record = matches!(item.payload, SyncPayload::Submission(_));
            if needs_record && !workflow_ids.contains(&item.record_id) {
                report.orphaned_queue_items.push(item.id);
            }
        }
        let mut unqueued: Vec<Uuid> = workflow_ids.difference(&queued).copied().collect();
        unqueued.sort();
        report.unqueued_workflows = unqueued;

        if !report.is_clean() {
            log::warn!(
                "store: recovery sweep found {} orphaned queue item(s)",
                report.orphaned_queue_items.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SyncAction;

    fn submission(name: &str) -> WorkflowSubmission {
        WorkflowSubmission::new(name, "Acme", "Ops")
    }

    #[tokio::test]
    async fn test_workflow_roundtrip() {
        let store = DurableStore::in_memory();
        let s = submission("Payroll");

        assert!(store.save_workflow(&s).await);
        assert_eq!(store.load_workflow(s.id).await, Some(s.clone()));
        assert_eq!(store.load_workflows().await.len(), 1);

        assert!(store.delete_workflow(s.id).await);
        assert_eq!(store.load_workflow(s.id).await, None);
    }

    #[tokio::test]
    async fn test_integrations_roundtrip() {
        use flowdoc_core::IntegrationKind;

        let store = DurableStore::in_memory();
        let slack = IntegrationConfig::from_template(IntegrationKind::Slack, Default::default());
        let asana = IntegrationConfig::from_template(IntegrationKind::Asana, Default::default());
        assert!(store.save_integration(&slack).await);
        assert!(store.save_integration(&asana).await);

        let names: Vec<String> = store.load_integrations().await.into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Asana".to_string(), "Slack".to_string()]);

        assert!(store.delete_integration(asana.id).await);
        assert_eq!(store.load_integrations().await, vec![slack]);
    }

    #[tokio::test]
    async fn test_write_failure_is_absorbed() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_writes(true);
        let store = DurableStore::new(backend.clone());

        assert!(!store.save_profile(&UserProfile::default()).await);
        assert_eq!(store.load_profile().await, None);
    }

    #[tokio::test]
    async fn test_for_each_skips_corrupt_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let store = DurableStore::new(backend.clone());
        store.save_workflow(&submission("Good")).await;
        backend
            .put(&StoreKey::new(Namespace::Workflows, "broken"), vec![0, 1, 2])
            .await
            .unwrap();

        let mut seen = Vec::new();
        store
            .for_each(Namespace::Workflows, |_, s: WorkflowSubmission| seen.push(s.name))
            .await;
        assert_eq!(seen, vec!["Good".to_string()]);
    }

    #[tokio::test]
    async fn test_recovery_sweep_reports_gaps() {
        let store = DurableStore::in_memory();

        let saved = submission("Saved but unqueued");
        store.save_workflow(&saved).await;

        let lost = submission("Queued but never saved");
        let item = SyncQueueItem::new(
            lost.id,
            SyncAction::Create,
            SyncPayload::Submission(Box::new(lost.clone())),
            1,
        );
        store.put_sync_item(&item).await;

        let tombstone = SyncQueueItem::new(Uuid::new_v4(), SyncAction::Delete, SyncPayload::Tombstone, 2);
        store.put_sync_item(&tombstone).await;

        let report = store.recovery_sweep().await;
        assert_eq!(report.unqueued_workflows, vec![saved.id]);
        assert_eq!(report.orphaned_queue_items, vec![item.id]);
        assert!(!report.is_clean());
    }
}
