//! Workflow State Store integration tests.
//!
//! Verifies:
//! - Sequential submits bump the version by exactly one; stale remote
//!   edits and snapshots never roll it back
//! - A failed or timed-out submit leaves the draft untouched
//! - Linear → graph → linear keeps the step list
//! - Deletes are queued and reach the remote after reconnecting
//! - Mutations made while online are pushed without waiting for a reconnect
//! - Remote events arriving during a submit are deferred and re-checked
//! - Integrations run against the selected workflow and report the outcome
//! - Saved state, integrations and pending sync items survive a restart
//!   (RocksDB)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use flowdoc_app::{
    AnalysisError, AnalysisGenerator, AnalysisResponse, AppConfig, AppContext, FormPhase,
    LocalAnalysis, RemoteOutcome, Services, WorkflowStore, SNAPSHOT_PATH,
};
use flowdoc_core::{
    default_questions, CommentDraft, IntegrationError, IntegrationPatch, NodeData, NodeKind,
    NotificationAction, NotificationKind, Position, WorkflowQuestion, WorkflowStep, WorkflowSubmission,
};
use flowdoc_sync::{
    CollaborationEvent, CollaborationUser, EventData, LoopbackTransport, MemoryBackend,
    RecordingAuthority, RocksBackend, RocksConfig, SyncAction,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Local analysis that can be told to fail, hang, or wait for a signal.
#[derive(Default)]
struct TestGenerator {
    failing: AtomicBool,
    hanging: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl AnalysisGenerator for TestGenerator {
    async fn generate(&self, questions: &[WorkflowQuestion]) -> Result<AnalysisResponse, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AnalysisError::Network("connection refused".into()));
        }
        Ok(LocalAnalysis::new().analyze(questions))
    }
}

struct Harness {
    ctx: AppContext,
    generator: Arc<TestGenerator>,
    authority: Arc<RecordingAuthority>,
    transport: Arc<LoopbackTransport>,
}

impl Harness {
    fn store(&self) -> &Arc<WorkflowStore> {
        self.ctx.store()
    }
}

async fn harness(online: bool) -> Harness {
    let generator = Arc::new(TestGenerator::default());
    let authority = Arc::new(RecordingAuthority::new());
    let transport = Arc::new(LoopbackTransport::new());
    let services = Services {
        backend: Arc::new(MemoryBackend::new()),
        transport: transport.clone(),
        authority: authority.clone(),
        generator: generator.clone(),
    };
    let config = AppConfig {
        start_online: online,
        ..AppConfig::for_testing()
    };
    Harness {
        ctx: AppContext::start(config, services).await,
        generator,
        authority,
        transport,
    }
}

async fn fill_form(store: &WorkflowStore) {
    for q in default_questions() {
        store.update_answer(&q.id, format!("answer to {}", q.id)).await;
    }
    store.set_workflow_name("Invoice approval").await;
    store.set_business_name("Acme").await;
    store.set_department_name("Finance").await;
}

async fn create_submission(store: &WorkflowStore) -> Uuid {
    fill_form(store).await;
    store.submit_workflow().await.expect("submit should succeed")
}

fn peer_edit(path: &str, value: serde_json::Value, base_version: u64) -> CollaborationEvent {
    CollaborationEvent::new(
        CollaborationUser::new("Grace", None),
        EventData::Edit {
            path: path.into(),
            value,
            base_version,
        },
        0,
    )
}

fn peer_snapshot(submission: &WorkflowSubmission) -> CollaborationEvent {
    peer_edit(
        SNAPSHOT_PATH,
        serde_json::to_value(submission).unwrap(),
        submission.version - 1,
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_version_increments_by_exactly_one() {
    let h = harness(false).await;
    let store = h.store();
    let id = create_submission(store).await;
    assert_eq!(store.submission(id).unwrap().version, 1);

    for expected in 2..=3 {
        assert!(store.edit_submission(id).await);
        store.update_answer("q14", format!("revision {expected}")).await;
        assert_eq!(store.submit_workflow().await, Some(id));
        assert_eq!(store.submission(id).unwrap().version, expected);
    }

    // A peer's snapshot of version 2 arrives late.
    let mut stale = store.submission(id).unwrap();
    stale.version = 2;
    stale.name = "Stale rename".into();
    assert_eq!(store.apply_remote_event(peer_snapshot(&stale)).await, RemoteOutcome::Stale);

    // A field edit made against version 2.
    assert!(store.edit_submission(id).await);
    let outcome = store
        .apply_remote_event(peer_edit("workflowName", "Stale rename".into(), 2))
        .await;
    assert_eq!(outcome, RemoteOutcome::Stale);

    let current = store.submission(id).unwrap();
    assert_eq!(current.version, 3);
    assert_eq!(current.name, "Invoice approval");
    assert_eq!(store.snapshot().current_workflow_name, "Invoice approval");
    assert_eq!(h.ctx.durable().load_workflow(id).await.unwrap().version, 3);
}

#[tokio::test]
async fn test_failed_submit_preserves_draft() {
    let h = harness(false).await;
    let store = h.store();
    let id = create_submission(store).await;

    assert!(store.edit_submission(id).await);
    store.update_answer("q3", "Email, Excel and a shared drive").await;
    let before = store.snapshot().current_questions;

    h.generator.failing.store(true, Ordering::SeqCst);
    assert_eq!(store.submit_workflow().await, None);

    let state = store.snapshot();
    assert_eq!(state.current_questions, before);
    assert!(state.is_editing);
    assert_eq!(state.current_submission_id, Some(id));
    assert_eq!(state.phase, FormPhase::SubmitFailed);
    assert!(!state.is_analyzing);
    assert_eq!(store.submission(id).unwrap().version, 1);

    let error = store
        .notifications()
        .into_iter()
        .find(|n| n.kind == NotificationKind::Error)
        .unwrap();
    assert_eq!(error.title, "Submission Failed");
    assert_eq!(error.action, Some(NotificationAction::RetrySubmit));

    // Only the original create is queued.
    let queued: Vec<SyncAction> = h.ctx.queue().pending().iter().map(|i| i.action).collect();
    assert_eq!(queued, vec![SyncAction::Create]);

    // Retrying after the service recovers saves the same draft.
    h.generator.failing.store(false, Ordering::SeqCst);
    assert_eq!(store.submit_workflow().await, Some(id));
    let saved = store.submission(id).unwrap();
    assert_eq!(saved.version, 2);
    assert_eq!(saved.questions, before);
}

#[tokio::test(start_paused = true)]
async fn test_analysis_timeout_fails_submit() {
    let h = harness(false).await;
    let store = h.store();
    fill_form(store).await;

    h.generator.hanging.store(true, Ordering::SeqCst);
    assert_eq!(store.submit_workflow().await, None);

    let state = store.snapshot();
    assert_eq!(state.phase, FormPhase::SubmitFailed);
    assert!(state.submissions.is_empty());
    assert!(state.current_questions.iter().all(|q| !q.answer.is_empty()));
    let error = store.notifications().into_iter().next().unwrap();
    assert!(error.message.contains("timed out"));
}

#[tokio::test]
async fn test_linear_graph_round_trip() {
    let h = harness(false).await;
    let store = h.store();
    let id = create_submission(store).await;
    assert!(store.edit_submission(id).await);

    let steps = store.snapshot().current_steps;
    assert_eq!(steps.len(), 5);

    store.toggle_workflow_type().await;
    let state = store.snapshot();
    assert!(!state.is_linear_workflow);
    let graph = state.current_graph.unwrap();
    assert_eq!(graph.nodes.len(), steps.len() + 2);
    assert_eq!(graph.edges.len(), steps.len() + 1);

    store.toggle_workflow_type().await;
    let state = store.snapshot();
    assert!(state.is_linear_workflow);
    assert_eq!(state.current_steps, steps);

    // Steps added on the graph are appended when flattening.
    store.toggle_workflow_type().await;
    let extra = WorkflowStep::new("step6", "Archive", "File the paid invoice");
    store
        .add_node(NodeKind::Step, NodeData::Step(extra.clone()), Position::new(250.0, 1050.0))
        .await;
    store.toggle_workflow_type().await;
    let flattened = store.snapshot().current_steps;
    assert_eq!(&flattened[..5], &steps[..]);
    assert_eq!(flattened[5], extra);
}

#[tokio::test]
async fn test_delete_is_queued_and_synced() {
    let h = harness(false).await;
    let store = h.store();
    let id = create_submission(store).await;

    assert!(store.delete_submission(id).await);
    assert!(store.submission(id).is_none());
    assert!(h.ctx.durable().load_workflow(id).await.is_none());

    let queued: Vec<(Uuid, SyncAction)> = h
        .ctx
        .queue()
        .pending()
        .iter()
        .map(|i| (i.record_id, i.action))
        .collect();
    assert_eq!(queued, vec![(id, SyncAction::Create), (id, SyncAction::Delete)]);
    assert_eq!(
        store.notifications().first().map(|n| n.title.clone()),
        Some("Workflow Deleted".to_string())
    );

    // Unknown ids change nothing.
    assert!(!store.delete_submission(Uuid::new_v4()).await);
    assert_eq!(h.ctx.queue().len(), 2);

    h.ctx.reachability().set_online(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let pushed: Vec<SyncAction> = h.authority.pushed().iter().map(|i| i.action).collect();
    assert_eq!(pushed, vec![SyncAction::Create, SyncAction::Delete]);
    assert!(h.ctx.queue().is_empty());
}

#[tokio::test]
async fn test_online_mutations_pushed_without_reconnect() {
    let h = harness(true).await;
    let store = h.store();
    let id = create_submission(store).await;

    // Well inside the periodic interval; the reachability flag never moves.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pushed: Vec<(Uuid, SyncAction)> = h.authority.pushed().iter().map(|i| (i.record_id, i.action)).collect();
    assert_eq!(pushed, vec![(id, SyncAction::Create)]);
    assert!(h.ctx.queue().is_empty());

    assert!(store.delete_submission(id).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let actions: Vec<SyncAction> = h.authority.pushed().iter().map(|i| i.action).collect();
    assert_eq!(actions, vec![SyncAction::Create, SyncAction::Delete]);
    assert!(h.ctx.queue().is_empty());
}

#[tokio::test]
async fn test_remote_events_deferred_during_submit() {
    let h = harness(false).await;
    let store = Arc::clone(h.store());
    let id = create_submission(&store).await;
    assert!(store.edit_submission(id).await);
    let original = store.submission(id).unwrap();

    h.generator.gated.store(true, Ordering::SeqCst);
    let submitting = Arc::clone(&store);
    let submit = tokio::spawn(async move { submitting.submit_workflow().await });
    while store.phase() != FormPhase::Submitting {
        tokio::task::yield_now().await;
    }

    let mut peer = original.clone();
    peer.version = 2;
    peer.name = "Peer rename".into();
    assert_eq!(store.apply_remote_event(peer_snapshot(&peer)).await, RemoteOutcome::Deferred);
    assert_eq!(
        store.apply_remote_event(peer_edit("workflowName", "Peer".into(), 1)).await,
        RemoteOutcome::Deferred
    );
    assert_eq!(store.submission(id).unwrap().version, 1);

    h.generator.gate.notify_one();
    assert_eq!(submit.await.unwrap(), Some(id));

    // Replayed after the local save: both are now stale.
    let saved = store.submission(id).unwrap();
    assert_eq!(saved.version, 2);
    assert_eq!(saved.name, "Invoice approval");

    // A genuinely newer snapshot still wins.
    peer.version = 3;
    assert_eq!(store.apply_remote_event(peer_snapshot(&peer)).await, RemoteOutcome::Applied);
    assert_eq!(store.submission(id).unwrap().name, "Peer rename");
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_peer_comment_merged_once() {
    let h = harness(true).await;
    let store = h.store();
    let id = create_submission(store).await;
    assert!(store.edit_submission(id).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.session().is_connected());

    let peer = CollaborationUser::new("Grace", None);
    let comment = CommentDraft::new("Who approves over $10k?").into_comment(peer.as_author());
    let event = CollaborationEvent::new(peer, EventData::Comment(comment.clone()), 3);
    h.transport.inject_event(id, &event).unwrap();
    h.transport.inject_event(id, &event).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.submission(id).unwrap().comments, vec![comment.clone()]);
    let persisted = h.ctx.durable().load_workflow(id).await.unwrap();
    assert_eq!(persisted.comments, vec![comment]);

    // Local comments go out through the session.
    let local = store.add_comment(CommentDraft::new("Finance head")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.submission(id).unwrap().comments.len(), 2);
    assert!(h
        .transport
        .sent_events()
        .iter()
        .any(|e| matches!(&e.data, EventData::Comment(c) if c.id == local.id)));
}

#[tokio::test]
async fn test_integration_executes_on_selected_workflow() {
    let h = harness(false).await;
    let store = h.store();
    let id = create_submission(store).await;
    let settings = BTreeMap::from([("webhookUrl".to_string(), "https://hooks.example/1".to_string())]);
    let zap = store.add_integration("zapier", settings).await.unwrap();
    assert_eq!(zap.settings["apiKey"], "");

    let run = store.execute_integration(zap.id, "notify").await.unwrap();
    assert_eq!(run.workflow_id, id);
    assert_eq!(run.message, "Successfully executed notify on Zapier");
    let latest = &store.notifications()[0];
    assert_eq!((latest.kind, latest.title.as_str()), (NotificationKind::Success, "Integration Executed"));

    let stamped = h.ctx.durable().load_integrations().await;
    assert_eq!(stamped[0].last_synced, Some(run.timestamp));

    store
        .update_integration(
            zap.id,
            IntegrationPatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        store.execute_integration(zap.id, "notify").await,
        Err(IntegrationError::Disabled("Zapier".into()))
    );
    let latest = &store.notifications()[0];
    assert_eq!((latest.kind, latest.title.as_str()), (NotificationKind::Error, "Execution Failed"));

    let missing = Uuid::new_v4();
    assert_eq!(
        store.execute_integration(missing, "notify").await,
        Err(IntegrationError::NotFound(missing))
    );
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        let generator = Arc::new(TestGenerator::default());
        Services {
            backend: Arc::new(RocksBackend::open(RocksConfig::for_testing(dir.path())).unwrap()),
            transport: Arc::new(LoopbackTransport::new()),
            authority: Arc::new(RecordingAuthority::new()),
            generator,
        }
    };
    let offline = || AppConfig {
        start_online: false,
        ..AppConfig::for_testing()
    };

    let id = {
        let ctx = AppContext::start(offline(), open()).await;
        let id = create_submission(ctx.store()).await;
        ctx.store().add_integration("notion", BTreeMap::new()).await.unwrap();
        ctx.store()
            .update_user_preferences(flowdoc_core::PreferencesPatch {
                notifications: Some(false),
                ..Default::default()
            })
            .await;
        ctx.shutdown().await;
        id
    };
    // Let aborted background tasks release the database.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ctx = AppContext::start(offline(), open()).await;
    let restored = ctx.store().submission(id).unwrap();
    assert_eq!(restored.name, "Invoice approval");
    assert_eq!(restored.steps.len(), 5);
    assert!(!ctx.store().snapshot().current_user.preferences.notifications);
    let names: Vec<String> = ctx.store().integrations().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["Notion".to_string()]);
    assert_eq!(ctx.queue().len(), 1);
    assert_eq!(ctx.queue().pending()[0].record_id, id);
}
