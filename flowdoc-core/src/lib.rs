//! # flowdoc-core — workflow documentation model
//!
//! Plain data shared by the sync layer and the application store:
//!
//! - [`model`] — submissions, questions, steps, comments, user profile
//! - [`graph`] — node/edge form of a workflow and linear ↔ graph conversion
//! - [`cost`] — per-task cost and savings projection
//! - [`comments`] — reply threads rebuilt from the flat comment list
//! - [`integration`] — third-party integration settings and templates
//! - [`notify`] — capped in-app notification feed
//! - [`validate`] — per-field answer checks run before submit

pub mod comments;
pub mod cost;
pub mod graph;
pub mod integration;
pub mod model;
pub mod notify;
pub mod validate;

pub use comments::{build_threads, CommentThread};
pub use cost::CostAnalysis;
pub use graph::{
    graph_to_linear, linear_to_graph, DecisionNode, EdgePatch, NodeData, NodeKind, NodePatch,
    Position, WorkflowEdge, WorkflowGraph, WorkflowNode,
};
pub use integration::{
    IntegrationConfig, IntegrationError, IntegrationKind, IntegrationPatch, IntegrationRun,
};
pub use model::{
    default_questions, CollaborationMode, Comment, CommentAuthor, CommentDraft, PreferencesPatch,
    StepStatus, Theme, ToolRecommendation, UserPreferences, UserProfile, UserRole,
    WorkflowQuestion, WorkflowStep, WorkflowSubmission,
};
pub use notify::{
    NotificationAction, NotificationCenter, NotificationKind, NotificationMessage,
    MAX_NOTIFICATIONS,
};
pub use validate::{validate_answers, AnswerError};
