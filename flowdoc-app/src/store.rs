//! Workflow State Store: the single source of truth for the authoring form,
//! the submission list and the UI flags.
//!
//! ```text
//!            edit_submission
//!   Saved ─────────────────────┐
//!     ▲                        ▼
//!     │        any input    ┌────────┐  submit   ┌────────────┐
//!     │  Draft ───────────► │Editing │ ────────► │ Submitting │
//!     │                     └────────┘           └─────┬──────┘
//!     │                         ▲  any input           │
//!     │                         └──── SubmitFailed ◄───┤ failure / timeout / conflict
//!     └────────────────────────────────────────────────┘ success
//! ```
//!
//! All state lives behind one `std::sync::Mutex` that is never held across
//! an `.await`. Durable writes, queue enqueues and collaboration sends
//! happen after the in-memory change has been committed.
//!
//! Every update of a saved record is a compare-and-swap on its `version`:
//! a local submit must start from the version currently stored, remote
//! edits must carry a `base_version` no older than it, and remote snapshots
//! only replace a record with a strictly higher version. Remote events that
//! arrive while a local submit for the same document is in flight are held
//! back and replayed, with the same checks, once the submit has finished.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowdoc_core::validate::DEFAULT_MIN_ANSWER_LEN;
use flowdoc_core::{
    default_questions, graph_to_linear, linear_to_graph, validate_answers, AnswerError, Comment,
    CommentDraft, CostAnalysis, EdgePatch, IntegrationConfig, IntegrationError, IntegrationKind,
    IntegrationPatch, IntegrationRun, NodeData, NodeKind, NodePatch, NotificationAction,
    NotificationCenter, NotificationKind, NotificationMessage, Position, PreferencesPatch,
    UserProfile, WorkflowEdge, WorkflowGraph, WorkflowNode, WorkflowQuestion, WorkflowStep,
    WorkflowSubmission,
};
use flowdoc_sync::{
    CollaborationEvent, CollaborationSession, CollaborationUser, DurableStore, EventChannel,
    EventData, EventHandler, ReachabilityMonitor, SyncAction, SyncPayload, SyncQueue,
};

use crate::analysis::{AnalysisError, AnalysisGenerator, AnalysisResponse};

/// Edit path whose value is a complete submission.
pub const SNAPSHOT_PATH: &str = "submission";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on one analysis call (default: 30s).
    pub analysis_timeout: Duration,
    /// Shortest accepted answer, in characters.
    pub min_answer_len: usize,
    /// Simulated round trip of one integration action (default: 1s).
    pub integration_latency: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            analysis_timeout: Duration::from_secs(30),
            min_answer_len: DEFAULT_MIN_ANSWER_LEN,
            integration_latency: Duration::from_secs(1),
        }
    }
}

impl StoreConfig {
    pub fn for_testing() -> Self {
        Self {
            analysis_timeout: Duration::from_secs(2),
            min_answer_len: 1,
            integration_latency: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormPhase {
    /// Fresh form, nothing entered yet.
    #[default]
    Draft,
    Editing,
    Submitting,
    Saved,
    /// The last submit failed; the form is intact and can be resubmitted.
    SubmitFailed,
}

/// What happened to a remote collaboration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Older than the local version; dropped.
    Stale,
    /// Held back until the in-flight submit finishes.
    Deferred,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("submission {0} no longer exists")]
    NotFound(Uuid),

    #[error("the workflow was changed elsewhere (now version {found}, edited from version {expected})")]
    Conflict { expected: u64, found: u64 },
}

/// Everything the presentation layer renders. [`WorkflowStore::snapshot`]
/// hands out consistent copies.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub phase: FormPhase,
    pub submissions: Vec<WorkflowSubmission>,
    pub current_questions: Vec<WorkflowQuestion>,
    pub current_steps: Vec<WorkflowStep>,
    pub current_business_name: String,
    pub current_department_name: String,
    pub current_workflow_name: String,
    pub current_graph: Option<WorkflowGraph>,
    pub is_linear_workflow: bool,
    /// The form is bound to an existing submission.
    pub is_editing: bool,
    pub current_submission_id: Option<Uuid>,
    /// Version of the bound submission when it was loaded into the form.
    pub base_version: Option<u64>,
    pub current_page: usize,
    pub show_form: bool,
    pub is_analyzing: bool,
    pub validation_errors: Vec<AnswerError>,
    pub last_submit_error: Option<SubmitError>,
    pub last_analysis: Option<AnalysisResponse>,
    pub cost_analysis: Option<CostAnalysis>,
    pub selected_submission: Option<Uuid>,
    pub current_user: UserProfile,
    pub is_collaborating: bool,
    pub collaborating_on: Option<Uuid>,
    pub active_collaborators: Vec<CollaborationUser>,
    pub integrations: Vec<IntegrationConfig>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            phase: FormPhase::Draft,
            submissions: Vec::new(),
            current_questions: default_questions(),
            current_steps: Vec::new(),
            current_business_name: String::new(),
            current_department_name: String::new(),
            current_workflow_name: String::new(),
            current_graph: None,
            is_linear_workflow: true,
            is_editing: false,
            current_submission_id: None,
            base_version: None,
            current_page: 0,
            show_form: false,
            is_analyzing: false,
            validation_errors: Vec::new(),
            last_submit_error: None,
            last_analysis: None,
            cost_analysis: None,
            selected_submission: None,
            current_user: UserProfile::default(),
            is_collaborating: false,
            collaborating_on: None,
            active_collaborators: Vec::new(),
            integrations: Vec::new(),
        }
    }
}

impl WorkflowState {
    pub fn submission(&self, id: Uuid) -> Option<&WorkflowSubmission> {
        self.submissions.iter().find(|s| s.id == id)
    }

    fn submission_mut(&mut self, id: Uuid) -> Option<&mut WorkflowSubmission> {
        self.submissions.iter_mut().find(|s| s.id == id)
    }

    /// The form is showing `id`.
    fn is_bound_to(&self, id: Uuid) -> bool {
        self.is_editing && self.current_submission_id == Some(id)
    }

    /// Record user input.
    fn touch(&mut self) {
        if self.phase != FormPhase::Submitting {
            self.phase = FormPhase::Editing;
        }
    }

    fn reset_form(&mut self) {
        self.current_questions = default_questions();
        self.current_steps.clear();
        self.current_business_name.clear();
        self.current_department_name.clear();
        self.current_workflow_name.clear();
        self.current_graph = None;
        self.is_linear_workflow = true;
        self.is_editing = false;
        self.current_submission_id = None;
        self.base_version = None;
        self.current_page = 0;
        self.show_form = false;
        self.validation_errors.clear();
    }

    fn load_into_form(&mut self, submission: &WorkflowSubmission) {
        self.current_questions = submission.questions.clone();
        self.current_steps = submission.steps.clone();
        self.current_business_name = submission.business_name.clone();
        self.current_department_name = submission.department_name.clone();
        self.current_workflow_name = submission.name.clone();
        self.current_graph = submission.graph.clone();
        self.is_linear_workflow = submission.is_linear;
        self.is_editing = true;
        self.current_submission_id = Some(submission.id);
        self.base_version = Some(submission.version);
        self.show_form = true;
        self.validation_errors.clear();
        self.last_submit_error = None;
        self.phase = FormPhase::Editing;
    }

    /// Switch between the step list and the graph. Going to the graph
    /// rebuilds it from the steps; coming back keeps the step list and
    /// takes over step data edited on graph nodes. Returns `false` if
    /// already in the requested form.
    fn set_linear(&mut self, linear: bool) -> bool {
        if self.is_linear_workflow == linear {
            return false;
        }
        if linear {
            if let Some(graph) = &self.current_graph {
                self.current_steps = graph_to_linear(graph, &self.current_steps);
            }
        } else {
            self.current_graph = Some(linear_to_graph(&self.current_steps));
        }
        self.is_linear_workflow = linear;
        true
    }

    /// Apply a field-level edit from a peer to the form.
    fn apply_field_edit(&mut self, path: &str, value: &Value) -> bool {
        let text = || value.as_str().map(str::to_string);
        match path {
            "businessName" => text().map(|v| self.current_business_name = v).is_some(),
            "departmentName" => text().map(|v| self.current_department_name = v).is_some(),
            "workflowName" => text().map(|v| self.current_workflow_name = v).is_some(),
            "isLinearWorkflow" => value.as_bool().map(|linear| self.set_linear(linear)).is_some(),
            _ => {
                if let Some(id) = path.strip_prefix("questions.").and_then(|p| p.strip_suffix(".answer")) {
                    let (Some(answer), Some(question)) =
                        (text(), self.current_questions.iter_mut().find(|q| q.id == id))
                    else {
                        return false;
                    };
                    question.answer = answer;
                    true
                } else if let Some(id) = path.strip_prefix("graph.nodes.") {
                    let graph = self.current_graph.get_or_insert_with(WorkflowGraph::default);
                    upsert_node(graph, id, value)
                } else if let Some(id) = path.strip_prefix("graph.edges.") {
                    let graph = self.current_graph.get_or_insert_with(WorkflowGraph::default);
                    upsert_edge(graph, id, value)
                } else {
                    log::debug!("ignoring edit on unknown path '{path}'");
                    false
                }
            }
        }
    }

    /// Merge one remote event into document `doc`. Returns the outcome and
    /// the record to persist, if it changed.
    fn merge_remote(
        &mut self,
        doc: Uuid,
        event: &CollaborationEvent,
        roster: Option<Vec<CollaborationUser>>,
    ) -> (RemoteOutcome, Option<WorkflowSubmission>) {
        match &event.data {
            EventData::Join | EventData::Leave => {
                if let Some(users) = roster {
                    self.active_collaborators = users;
                }
                (RemoteOutcome::Applied, None)
            }
            EventData::Cursor(_) => (RemoteOutcome::Ignored, None),
            EventData::Comment(comment) => {
                let Some(sub) = self.submission_mut(doc) else {
                    return (RemoteOutcome::Ignored, None);
                };
                if sub.push_comment(comment.clone()) {
                    (RemoteOutcome::Applied, Some(sub.clone()))
                } else {
                    (RemoteOutcome::Ignored, None)
                }
            }
            EventData::Edit {
                path,
                value,
                base_version,
            } => {
                let Some(local) = self.submission(doc) else {
                    return (RemoteOutcome::Ignored, None);
                };
                let version = local.version;

                if path == SNAPSHOT_PATH {
                    let mut snapshot: WorkflowSubmission = match serde_json::from_value(value.clone()) {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            log::warn!("ignoring malformed snapshot from '{}': {e}", event.user.name);
                            return (RemoteOutcome::Ignored, None);
                        }
                    };
                    if snapshot.id != doc {
                        return (RemoteOutcome::Ignored, None);
                    }
                    if snapshot.version <= version {
                        log::debug!("stale snapshot v{} (local v{version})", snapshot.version);
                        return (RemoteOutcome::Stale, None);
                    }
                    for comment in &local.comments {
                        snapshot.push_comment(comment.clone());
                    }
                    if let Some(slot) = self.submission_mut(doc) {
                        *slot = snapshot.clone();
                    }
                    return (RemoteOutcome::Applied, Some(snapshot));
                }

                if *base_version < version {
                    log::debug!("stale edit on '{path}' from v{base_version} (local v{version})");
                    return (RemoteOutcome::Stale, None);
                }
                if !self.is_bound_to(doc) {
                    return (RemoteOutcome::Ignored, None);
                }
                if self.apply_field_edit(path, value) {
                    (RemoteOutcome::Applied, None)
                } else {
                    (RemoteOutcome::Ignored, None)
                }
            }
        }
    }
}

fn upsert_node(graph: &mut WorkflowGraph, id: &str, value: &Value) -> bool {
    if value.is_null() {
        return graph.remove_node(id);
    }
    match serde_json::from_value::<WorkflowNode>(value.clone()) {
        Ok(node) if node.id == id => {
            match graph.nodes.iter_mut().find(|n| n.id == id) {
                Some(slot) => *slot = node,
                None => graph.nodes.push(node),
            }
            true
        }
        _ => false,
    }
}

fn upsert_edge(graph: &mut WorkflowGraph, id: &str, value: &Value) -> bool {
    if value.is_null() {
        return graph.remove_edge(id);
    }
    match serde_json::from_value::<WorkflowEdge>(value.clone()) {
        Ok(edge) if edge.id == id => {
            match graph.edges.iter_mut().find(|e| e.id == id) {
                Some(slot) => *slot = edge,
                None => graph.edges.push(edge),
            }
            true
        }
        _ => false,
    }
}

fn to_json<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value)
        .map_err(|e| log::warn!("could not encode edit value: {e}"))
        .ok()
}

/// Form contents captured when a submit starts.
struct Draft {
    questions: Vec<WorkflowQuestion>,
    name: String,
    business_name: String,
    department_name: String,
    graph: Option<WorkflowGraph>,
    is_linear: bool,
    /// Existing submission being updated, if any.
    target: Option<Uuid>,
    base_version: Option<u64>,
}

impl Draft {
    fn apply_to(&self, submission: &mut WorkflowSubmission, response: &AnalysisResponse) {
        submission.questions = self.questions.clone();
        submission.name = self.name.clone();
        submission.business_name = self.business_name.clone();
        submission.department_name = self.department_name.clone();
        submission.graph = self.graph.clone();
        submission.is_linear = self.is_linear;
        submission.steps = response.steps.clone();
        submission.analysis = Some(response.analysis.clone());
        submission.recommendations = response.recommendations.clone();
        submission.tools = response.tools.clone();
        submission.cost_analysis = Some(response.cost_analysis);
        submission.hourly_rate = Some(response.hourly_rate);
    }
}

fn or_untitled(value: &str, fallback: &str) -> String {
    match value.trim() {
        "" => fallback.to_string(),
        v => v.to_string(),
    }
}

#[derive(Default)]
struct Pending {
    /// Existing submission whose submit is running.
    in_flight: Option<Uuid>,
    deferred: Vec<CollaborationEvent>,
}

/// Collaborators the store is constructed with.
pub struct StoreServices {
    pub durable: DurableStore,
    pub queue: Arc<SyncQueue>,
    pub reachability: ReachabilityMonitor,
    pub session: CollaborationSession,
    pub notifications: Arc<NotificationCenter>,
    pub generator: Arc<dyn AnalysisGenerator>,
}

pub struct WorkflowStore {
    state: Mutex<WorkflowState>,
    pending: Mutex<Pending>,
    listener: Mutex<Option<JoinHandle<()>>>,
    durable: DurableStore,
    queue: Arc<SyncQueue>,
    reachability: ReachabilityMonitor,
    session: CollaborationSession,
    notifications: Arc<NotificationCenter>,
    generator: Arc<dyn AnalysisGenerator>,
    config: StoreConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkflowStore {
    pub fn new(services: StoreServices, config: StoreConfig) -> Self {
        Self {
            state: Mutex::new(WorkflowState::default()),
            pending: Mutex::new(Pending::default()),
            listener: Mutex::new(None),
            durable: services.durable,
            queue: services.queue,
            reachability: services.reachability,
            session: services.session,
            notifications: services.notifications,
            generator: services.generator,
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, WorkflowState> {
        lock(&self.state)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn session(&self) -> &CollaborationSession {
        &self.session
    }

    /// Reload submissions, integrations and the user profile from the
    /// durable store.
    pub async fn hydrate(&self) -> usize {
        let submissions = self.durable.load_workflows().await;
        let integrations = self.durable.load_integrations().await;
        let profile = self.durable.load_profile().await;

        let mut state = self.state();
        let count = submissions.len();
        state.submissions = submissions;
        state.integrations = integrations;
        if let Some(profile) = profile {
            state.current_user = profile;
        }
        log::info!("hydrated {count} submission(s) for '{}'", state.current_user.name);
        count
    }

    pub fn snapshot(&self) -> WorkflowState {
        self.state().clone()
    }

    pub fn submissions(&self) -> Vec<WorkflowSubmission> {
        self.state().submissions.clone()
    }

    pub fn submission(&self, id: Uuid) -> Option<WorkflowSubmission> {
        self.state().submission(id).cloned()
    }

    pub fn phase(&self) -> FormPhase {
        self.state().phase
    }

    // ── Form input ──────────────────────────────────────────────────

    /// Returns `false` for an unknown question id.
    pub async fn update_answer(&self, question_id: &str, text: impl Into<String>) -> bool {
        let text = text.into();
        {
            let mut state = self.state();
            let Some(question) = state.current_questions.iter_mut().find(|q| q.id == question_id) else {
                return false;
            };
            question.answer = text.clone();
            state.validation_errors.retain(|e| e.question_id() != question_id);
            state.touch();
        }
        self.broadcast(format!("questions.{question_id}.answer"), Value::String(text))
            .await;
        true
    }

    pub async fn set_business_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut state = self.state();
            state.current_business_name = name.clone();
            state.touch();
        }
        self.broadcast("businessName".into(), Value::String(name)).await;
    }

    pub async fn set_department_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut state = self.state();
            state.current_department_name = name.clone();
            state.touch();
        }
        self.broadcast("departmentName".into(), Value::String(name)).await;
    }

    pub async fn set_workflow_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut state = self.state();
            state.current_workflow_name = name.clone();
            state.touch();
        }
        self.broadcast("workflowName".into(), Value::String(name)).await;
    }

    pub fn set_current_page(&self, page: usize) {
        self.state().current_page = page;
    }

    pub fn set_show_form(&self, show: bool) {
        self.state().show_form = show;
    }

    pub fn select_submission(&self, id: Option<Uuid>) {
        self.state().selected_submission = id;
    }

    /// Per-field problems with the current answers.
    pub fn validate(&self) -> Vec<AnswerError> {
        validate_answers(&self.state().current_questions, self.config.min_answer_len)
    }

    /// Clear the form and leave any collaboration session.
    pub async fn reset_form(&self) {
        {
            let mut state = self.state();
            state.reset_form();
            state.last_analysis = None;
            state.last_submit_error = None;
            state.phase = FormPhase::Draft;
        }
        self.stop_collaboration().await;
    }

    /// Send a form edit to peers when the form is bound to the document
    /// being collaborated on.
    async fn broadcast(&self, path: String, value: Value) {
        let base_version = {
            let state = self.state();
            match (state.is_collaborating, state.collaborating_on) {
                (true, Some(doc)) if state.is_bound_to(doc) => state.base_version.unwrap_or_default(),
                _ => return,
            }
        };
        if let Err(e) = self.session.send_edit(path, value, base_version).await {
            log::debug!("edit not broadcast: {e}");
        }
    }

    // ── Submit ──────────────────────────────────────────────────────

    /// Analyze and save the form. Returns the saved submission id, or
    /// `None` if validation, analysis or the version check failed. On
    /// failure the form is left exactly as it was.
    pub async fn submit_workflow(&self) -> Option<Uuid> {
        let draft = {
            let mut state = self.state();
            if state.phase == FormPhase::Submitting {
                log::debug!("submit already in progress");
                return None;
            }
            let errors = validate_answers(&state.current_questions, self.config.min_answer_len);
            if !errors.is_empty() {
                log::info!("submit blocked by {} invalid answer(s)", errors.len());
                state.validation_errors = errors;
                return None;
            }
            state.validation_errors.clear();
            state.phase = FormPhase::Submitting;
            state.is_analyzing = true;

            let target = if state.is_editing { state.current_submission_id } else { None };
            Draft {
                questions: state.current_questions.clone(),
                name: or_untitled(&state.current_workflow_name, "Untitled Workflow"),
                business_name: or_untitled(&state.current_business_name, "Untitled Business"),
                department_name: or_untitled(&state.current_department_name, "Untitled Department"),
                graph: state.current_graph.clone(),
                is_linear: state.is_linear_workflow,
                target,
                base_version: state.base_version,
            }
        };
        lock(&self.pending).in_flight = draft.target;

        let timeout = self.config.analysis_timeout;
        let result = match tokio::time::timeout(timeout, self.generator.generate(&draft.questions)).await {
            Ok(result) => result.map_err(SubmitError::from),
            Err(_) => Err(SubmitError::Analysis(AnalysisError::Timeout(timeout))),
        };

        let (saved, degraded) = match result.and_then(|response| self.commit(&draft, response)) {
            Ok(committed) => committed,
            Err(e) => {
                self.fail_submit(e);
                self.replay_deferred().await;
                return None;
            }
        };
        let id = saved.id;

        let action = if draft.target.is_some() {
            SyncAction::Update
        } else {
            SyncAction::Create
        };
        self.durable.save_workflow(&saved).await;
        self.queue
            .enqueue(id, action, SyncPayload::Submission(Box::new(saved.clone())))
            .await;
        self.queue.drain_if_online(&self.reachability);

        self.notifications.add(
            NotificationKind::Success,
            "Workflow Saved",
            format!("Your workflow \"{}\" has been saved successfully.", saved.name),
            Some(NotificationAction::ViewSubmission(id)),
        );
        if degraded {
            self.notifications.add(
                NotificationKind::Warning,
                "Analysis Unavailable",
                "The analysis service could not be reached, so default steps were generated. \
                 You can refine them and submit again later.",
                None,
            );
        }
        log::info!("saved '{}' ({id}) at v{}", saved.name, saved.version);

        self.broadcast_snapshot(&saved).await;
        self.replay_deferred().await;
        Some(id)
    }

    /// Merge a successful analysis into the submission list in one step.
    fn commit(
        &self,
        draft: &Draft,
        response: AnalysisResponse,
    ) -> Result<(WorkflowSubmission, bool), SubmitError> {
        let mut state = self.state();

        let submission = match draft.target {
            Some(id) => {
                let existing = state.submission(id).ok_or(SubmitError::NotFound(id))?;
                let expected = draft.base_version.unwrap_or(existing.version);
                if existing.version != expected {
                    return Err(SubmitError::Conflict {
                        expected,
                        found: existing.version,
                    });
                }
                let mut next = existing.clone();
                draft.apply_to(&mut next, &response);
                next.version = existing.version + 1;
                next.updated_at = Some(Utc::now());
                next
            }
            None => {
                let mut created = WorkflowSubmission::new(
                    draft.name.clone(),
                    draft.business_name.clone(),
                    draft.department_name.clone(),
                );
                draft.apply_to(&mut created, &response);
                created
            }
        };

        match state.submission_mut(submission.id) {
            Some(slot) => *slot = submission.clone(),
            None => state.submissions.push(submission.clone()),
        }

        let degraded = response.degraded;
        state.cost_analysis = Some(response.cost_analysis);
        state.last_analysis = Some(response);
        state.reset_form();
        state.phase = FormPhase::Saved;
        state.is_analyzing = false;
        state.last_submit_error = None;
        state.selected_submission = Some(submission.id);
        Ok((submission, degraded))
    }

    fn fail_submit(&self, error: SubmitError) {
        log::warn!("submit failed: {error}");
        {
            let mut state = self.state();
            state.phase = FormPhase::SubmitFailed;
            state.is_analyzing = false;
            state.last_submit_error = Some(error.clone());
        }
        self.notifications.add(
            NotificationKind::Error,
            "Submission Failed",
            format!("There was an error saving your workflow: {error}"),
            Some(NotificationAction::RetrySubmit),
        );
    }

    async fn broadcast_snapshot(&self, saved: &WorkflowSubmission) {
        let collaborating = {
            let state = self.state();
            state.is_collaborating && state.collaborating_on == Some(saved.id)
        };
        if !collaborating {
            return;
        }
        let Some(value) = to_json(saved) else {
            return;
        };
        if let Err(e) = self
            .session
            .send_edit(SNAPSHOT_PATH, value, saved.version.saturating_sub(1))
            .await
        {
            log::debug!("snapshot not broadcast: {e}");
        }
    }

    async fn replay_deferred(&self) {
        let deferred = {
            let mut pending = lock(&self.pending);
            pending.in_flight = None;
            std::mem::take(&mut pending.deferred)
        };
        if !deferred.is_empty() {
            log::debug!("replaying {} deferred remote event(s)", deferred.len());
        }
        for event in deferred {
            self.apply_remote_event(event).await;
        }
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Open `id` in the form and join its collaboration session. Unknown
    /// ids are ignored.
    pub async fn edit_submission(self: &Arc<Self>, id: Uuid) -> bool {
        {
            let mut state = self.state();
            let Some(submission) = state.submission(id).cloned() else {
                log::debug!("edit of unknown submission {id} ignored");
                return false;
            };
            state.load_into_form(&submission);
        }
        self.start_collaboration(id).await;
        true
    }

    /// Remove `id` locally and queue the delete. Unknown ids are ignored.
    pub async fn delete_submission(&self, id: Uuid) -> bool {
        let collaborating = {
            let mut state = self.state();
            let before = state.submissions.len();
            state.submissions.retain(|s| s.id != id);
            if state.submissions.len() == before {
                log::debug!("delete of unknown submission {id} ignored");
                return false;
            }
            if state.current_submission_id == Some(id) {
                state.reset_form();
                state.phase = FormPhase::Draft;
            }
            if state.selected_submission == Some(id) {
                state.selected_submission = None;
            }
            state.collaborating_on == Some(id)
        };
        if collaborating {
            self.stop_collaboration().await;
        }

        self.durable.delete_workflow(id).await;
        self.queue.enqueue(id, SyncAction::Delete, SyncPayload::Tombstone).await;
        self.queue.drain_if_online(&self.reachability);
        self.notifications.add(
            NotificationKind::Success,
            "Workflow Deleted",
            "Your workflow has been deleted successfully.",
            None,
        );
        true
    }

    // ── Graph ───────────────────────────────────────────────────────

    pub async fn toggle_workflow_type(&self) {
        let linear = {
            let mut state = self.state();
            let linear = !state.is_linear_workflow;
            state.set_linear(linear);
            state.touch();
            linear
        };
        self.broadcast("isLinearWorkflow".into(), Value::Bool(linear)).await;
    }

    pub async fn add_node(&self, kind: NodeKind, data: NodeData, position: Position) -> String {
        let (id, node) = {
            let mut state = self.state();
            let graph = state.current_graph.get_or_insert_with(WorkflowGraph::default);
            let id = graph.add_node(kind, data, position);
            let node = graph.node(&id).cloned();
            state.touch();
            (id, node)
        };
        if let Some(value) = node.as_ref().and_then(to_json) {
            self.broadcast(format!("graph.nodes.{id}"), value).await;
        }
        id
    }

    pub async fn update_node(&self, id: &str, patch: NodePatch) -> bool {
        let node = {
            let mut state = self.state();
            let Some(graph) = state.current_graph.as_mut() else {
                return false;
            };
            if !graph.update_node(id, patch) {
                return false;
            }
            let node = graph.node(id).cloned();
            state.touch();
            node
        };
        if let Some(value) = node.as_ref().and_then(to_json) {
            self.broadcast(format!("graph.nodes.{id}"), value).await;
        }
        true
    }

    pub async fn remove_node(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state();
            let removed = state.current_graph.as_mut().is_some_and(|g| g.remove_node(id));
            if removed {
                state.touch();
            }
            removed
        };
        if removed {
            self.broadcast(format!("graph.nodes.{id}"), Value::Null).await;
        }
        removed
    }

    pub async fn add_edge(
        &self,
        source: impl Into<String>,
        target: impl Into<String>,
        label: Option<String>,
    ) -> String {
        let (id, edge) = {
            let mut state = self.state();
            let graph = state.current_graph.get_or_insert_with(WorkflowGraph::default);
            let id = graph.add_edge(source, target, label);
            let edge = graph.edge(&id).cloned();
            state.touch();
            (id, edge)
        };
        if let Some(value) = edge.as_ref().and_then(to_json) {
            self.broadcast(format!("graph.edges.{id}"), value).await;
        }
        id
    }

    pub async fn update_edge(&self, id: &str, patch: EdgePatch) -> bool {
        let edge = {
            let mut state = self.state();
            let Some(graph) = state.current_graph.as_mut() else {
                return false;
            };
            if !graph.update_edge(id, patch) {
                return false;
            }
            let edge = graph.edge(id).cloned();
            state.touch();
            edge
        };
        if let Some(value) = edge.as_ref().and_then(to_json) {
            self.broadcast(format!("graph.edges.{id}"), value).await;
        }
        true
    }

    pub async fn remove_edge(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state();
            let removed = state.current_graph.as_mut().is_some_and(|g| g.remove_edge(id));
            if removed {
                state.touch();
            }
            removed
        };
        if removed {
            self.broadcast(format!("graph.edges.{id}"), Value::Null).await;
        }
        removed
    }

    // ── Collaboration ───────────────────────────────────────────────

    /// Join the session for `id` as the current user. Remote events are
    /// merged in the background until [`Self::stop_collaboration`].
    pub async fn start_collaboration(self: &Arc<Self>, id: Uuid) -> bool {
        let (name, user) = {
            let state = self.state();
            let Some(submission) = state.submission(id) else {
                return false;
            };
            let profile = &state.current_user;
            (
                submission.name.clone(),
                CollaborationUser::new(profile.name.clone(), profile.avatar.clone()),
            )
        };

        self.session.start(id, user).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<CollaborationEvent>();
        let forward: EventHandler = Arc::new(move |event: &CollaborationEvent| {
            let _ = tx.send(event.clone());
        });
        self.session.on(EventChannel::All, forward);

        let store = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(store) = store.upgrade() else {
                    return;
                };
                store.apply_remote_event(event).await;
            }
        });
        if let Some(previous) = lock(&self.listener).replace(task) {
            previous.abort();
        }

        let users = self.session.active_users();
        let others = users.len().saturating_sub(1);
        {
            let mut state = self.state();
            state.is_collaborating = true;
            state.collaborating_on = Some(id);
            state.active_collaborators = users;
        }
        self.notifications.add(
            NotificationKind::Info,
            "Collaboration Started",
            format!("You are now collaborating on \"{name}\" with {others} other users."),
            None,
        );
        true
    }

    pub async fn stop_collaboration(&self) {
        {
            let mut state = self.state();
            state.is_collaborating = false;
            state.collaborating_on = None;
            state.active_collaborators.clear();
        }
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
        lock(&self.pending).deferred.clear();
        self.session.stop().await;
    }

    /// Comment on the submission open in the form. Returns `None` when no
    /// submission is open.
    pub async fn add_comment(&self, draft: CommentDraft) -> Option<Comment> {
        let (target, collaborating, profile) = {
            let state = self.state();
            let target = state.current_submission_id?;
            let collaborating = state.is_collaborating && state.collaborating_on == Some(target);
            (target, collaborating, state.current_user.clone())
        };

        let session_comment = if collaborating {
            self.session.send_comment(draft.clone()).await.ok()
        } else {
            None
        };
        let comment = session_comment.unwrap_or_else(|| {
            draft.into_comment(CollaborationUser::new(profile.name, profile.avatar).as_author())
        });

        let updated = {
            let mut state = self.state();
            state
                .submission_mut(target)
                .and_then(|s| s.push_comment(comment.clone()).then(|| s.clone()))
        };
        if let Some(submission) = updated {
            self.durable.save_workflow(&submission).await;
            self.queue
                .enqueue(target, SyncAction::Update, SyncPayload::Submission(Box::new(submission)))
                .await;
            self.queue.drain_if_online(&self.reachability);
        }
        Some(comment)
    }

    /// Merge an event received from a peer.
    pub async fn apply_remote_event(&self, event: CollaborationEvent) -> RemoteOutcome {
        let doc = self.state().collaborating_on;
        let Some(doc) = doc else {
            return RemoteOutcome::Ignored;
        };
        {
            let mut pending = lock(&self.pending);
            if pending.in_flight == Some(doc) {
                pending.deferred.push(event);
                return RemoteOutcome::Deferred;
            }
        }

        let roster = matches!(event.data, EventData::Join | EventData::Leave).then(|| self.session.active_users());
        let (outcome, changed) = self.state().merge_remote(doc, &event, roster);
        if let Some(submission) = changed {
            self.durable.save_workflow(&submission).await;
        }
        outcome
    }

    // ── Profile ─────────────────────────────────────────────────────

    pub async fn set_current_user(&self, profile: UserProfile) {
        self.state().current_user = profile.clone();
        self.durable.save_profile(&profile).await;
    }

    pub async fn update_user_preferences(&self, patch: PreferencesPatch) {
        let profile = {
            let mut state = self.state();
            state.current_user.preferences.apply(patch);
            state.current_user.clone()
        };
        self.durable.save_profile(&profile).await;
    }

    // ── Integrations ────────────────────────────────────────────────

    pub fn integrations(&self) -> Vec<IntegrationConfig> {
        self.state().integrations.clone()
    }

    pub fn integration(&self, id: Uuid) -> Option<IntegrationConfig> {
        self.state().integrations.iter().find(|i| i.id == id).cloned()
    }

    /// Create an integration of type `kind` from its template.
    pub async fn add_integration(
        &self,
        kind: &str,
        settings: BTreeMap<String, String>,
    ) -> Result<IntegrationConfig, IntegrationError> {
        let kind = match kind.parse::<IntegrationKind>() {
            Ok(kind) => kind,
            Err(e) => {
                self.integration_failed("Integration Failed", "adding", &e);
                return Err(e);
            }
        };
        let integration = IntegrationConfig::from_template(kind, settings);
        self.state().integrations.push(integration.clone());
        self.durable.save_integration(&integration).await;

        self.notifications.add(
            NotificationKind::Success,
            "Integration Added",
            format!("The {} integration has been added successfully.", integration.name),
            None,
        );
        log::info!("added {kind} integration {}", integration.id);
        Ok(integration)
    }

    pub async fn update_integration(
        &self,
        id: Uuid,
        patch: IntegrationPatch,
    ) -> Result<IntegrationConfig, IntegrationError> {
        let updated = {
            let mut state = self.state();
            state.integrations.iter_mut().find(|i| i.id == id).map(|integration| {
                integration.apply(patch);
                integration.clone()
            })
        };
        let Some(updated) = updated else {
            let e = IntegrationError::NotFound(id);
            self.integration_failed("Update Failed", "updating", &e);
            return Err(e);
        };
        self.durable.save_integration(&updated).await;

        self.notifications.add(
            NotificationKind::Success,
            "Integration Updated",
            format!("The {} integration has been updated successfully.", updated.name),
            None,
        );
        Ok(updated)
    }

    pub async fn remove_integration(&self, id: Uuid) -> Result<(), IntegrationError> {
        let removed = {
            let mut state = self.state();
            let pos = state.integrations.iter().position(|i| i.id == id);
            pos.map(|pos| state.integrations.remove(pos))
        };
        let Some(removed) = removed else {
            let e = IntegrationError::NotFound(id);
            self.integration_failed("Removal Failed", "removing", &e);
            return Err(e);
        };
        self.durable.delete_integration(id).await;

        self.notifications.add(
            NotificationKind::Success,
            "Integration Removed",
            format!("The {} integration has been removed successfully.", removed.name),
            None,
        );
        Ok(())
    }

    /// Run `action` on the submission bound to the form, or failing that
    /// the selected one.
    ///
    /// Nothing leaves the process: the call waits out
    /// `integration_latency`, stamps `last_synced` and reports success.
    pub async fn execute_integration(
        &self,
        id: Uuid,
        action: impl Into<String>,
    ) -> Result<IntegrationRun, IntegrationError> {
        let action = action.into();
        let checked = {
            let state = self.state();
            state
                .current_submission_id
                .or(state.selected_submission)
                .filter(|doc| state.submission(*doc).is_some())
                .ok_or(IntegrationError::NoActiveWorkflow)
                .and_then(|doc| match state.integrations.iter().find(|i| i.id == id) {
                    None => Err(IntegrationError::NotFound(id)),
                    Some(i) if !i.enabled => Err(IntegrationError::Disabled(i.name.clone())),
                    Some(i) => Ok((doc, i.name.clone())),
                })
        };
        let (workflow_id, name) = match checked {
            Ok(checked) => checked,
            Err(e) => {
                self.integration_failed("Execution Failed", "executing", &e);
                return Err(e);
            }
        };

        log::debug!("executing '{action}' on {name} for {workflow_id}");
        tokio::time::sleep(self.config.integration_latency).await;

        let now = Utc::now();
        let stamped = {
            let mut state = self.state();
            state.integrations.iter_mut().find(|i| i.id == id).map(|integration| {
                integration.last_synced = Some(now);
                integration.clone()
            })
        };
        match stamped {
            Some(integration) => {
                self.durable.save_integration(&integration).await;
            }
            // Removed while the action ran.
            None => log::debug!("integration {id} went away during '{action}'"),
        }

        self.notifications.add(
            NotificationKind::Success,
            "Integration Executed",
            format!("The integration action \"{action}\" was executed successfully."),
            None,
        );
        Ok(IntegrationRun {
            id: Uuid::new_v4(),
            integration_id: id,
            workflow_id,
            message: format!("Successfully executed {action} on {name}"),
            action,
            timestamp: now,
        })
    }

    fn integration_failed(&self, title: &str, verb: &str, error: &IntegrationError) {
        log::warn!("{verb} integration failed: {error}");
        self.notifications.add(
            NotificationKind::Error,
            title,
            format!("There was an error {verb} the integration: {error}"),
            None,
        );
    }

    // ── Notifications ───────────────────────────────────────────────

    pub fn add_notification(
        &self,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        action: Option<NotificationAction>,
    ) -> NotificationMessage {
        self.notifications.add(kind, title, message, action)
    }

    pub fn mark_notification_read(&self, id: Uuid) -> bool {
        self.notifications.mark_read(id)
    }

    pub fn mark_all_notifications_read(&self) {
        self.notifications.mark_all_read();
    }

    pub fn remove_notification(&self, id: Uuid) -> bool {
        self.notifications.remove(id)
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<NotificationMessage> {
        self.notifications.snapshot()
    }
}

impl Drop for WorkflowStore {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
    }
}
