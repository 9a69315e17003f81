//! Workflow documentation data model.
//!
//! All types here are plain serde values so they can travel through the
//! durable store (bincode) and the collaboration channel (JSON) unchanged.
//! None of them use `skip_serializing_if` or internally tagged enums, which
//! would break the non-self-describing bincode encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cost::CostAnalysis;
use crate::graph::WorkflowGraph;

/// One questionnaire entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuestion {
    pub id: String,
    pub question: String,
    pub answer: String,
}

impl WorkflowQuestion {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            answer: String::new(),
        }
    }
}

const DEFAULT_QUESTIONS: [(&str, &str); 16] = [
    ("q1", "What workflow would you like to automate or improve with AI?"),
    ("q2", "List the key steps in your workflow in order."),
    ("q3", "Which tools or software do you currently use for each step?"),
    ("q4", "Which steps in the process involve manual data entry or repetitive tasks?"),
    ("q5", "Who are the key people involved in this process, and what are their specific roles?"),
    ("q6", "How do you typically receive the information or input needed to start this process?"),
    ("q7", "For each step, what key decisions do you need to make?"),
    ("q8", "Are there any points in the process where you have to wait for input or approval from others?"),
    ("q9", "What are the most common problems or bottlenecks you encounter in this workflow?"),
    ("q10", "How do you handle exceptions or unexpected issues that arise during this process?"),
    ("q11", "What is the final output of this workflow (e.g., report, invoice, approval)?"),
    ("q12", "How do you measure the quality and accuracy of the output?"),
    ("q13", "Which steps in this process could be easily automated with the right tools?"),
    ("q14", "How frequently do you perform this workflow? (Daily, weekly, monthly, etc.)"),
    ("q15", "How much time does each step in this workflow take on average?"),
    ("q16", "What is your monthly salary or cost to the company? (Approximate figures are fine; this helps calculate potential savings from automation)"),
];

/// The blank questionnaire every new draft starts from.
pub fn default_questions() -> Vec<WorkflowQuestion> {
    DEFAULT_QUESTIONS
        .iter()
        .map(|(id, text)| WorkflowQuestion::new(*id, *text))
        .collect()
}

/// Progress of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

/// A single step of the documented process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Minutes per execution.
    pub time_estimate: Option<f64>,
    pub manual_cost: Option<f64>,
    pub ai_assisted_cost: Option<f64>,
    pub tools: Vec<String>,
    pub instructions: Option<String>,
    /// Ids of steps that must complete first.
    pub dependencies: Vec<String>,
    pub assignee: Option<String>,
    pub status: StepStatus,
    pub comments: Vec<Comment>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            time_estimate: None,
            manual_cost: None,
            ai_assisted_cost: None,
            tools: Vec::new(),
            instructions: None,
            dependencies: Vec::new(),
            assignee: None,
            status: StepStatus::NotStarted,
            comments: Vec::new(),
        }
    }
}

/// Display identity attached to a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAuthor {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    pub color: String,
}

/// A comment on a submission or one of its steps.
///
/// Threads are a flat list with `reply_to` back-references; see
/// [`crate::comments::build_threads`] for the display shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author: CommentAuthor,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub reply_to: Option<Uuid>,
}

/// What a caller supplies to create a comment; id, author and timestamp are
/// assigned at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentDraft {
    pub text: String,
    pub step_id: Option<String>,
    pub reply_to: Option<Uuid>,
}

impl CommentDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Stamp the draft with a fresh id and the current time.
    pub fn into_comment(self, author: CommentAuthor) -> Comment {
        Comment {
            id: Uuid::new_v4(),
            author,
            text: self.text,
            timestamp: Utc::now(),
            step_id: self.step_id,
            reply_to: self.reply_to,
        }
    }
}

/// A third-party tool suggested by the analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecommendation {
    pub name: String,
    pub description: String,
    pub cost: Option<String>,
}

/// A saved, versioned workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSubmission {
    pub id: Uuid,
    pub name: String,
    pub business_name: String,
    pub department_name: String,
    pub questions: Vec<WorkflowQuestion>,
    pub steps: Vec<WorkflowStep>,
    pub graph: Option<WorkflowGraph>,
    pub is_linear: bool,
    pub analysis: Option<String>,
    pub recommendations: Vec<String>,
    pub tools: Vec<ToolRecommendation>,
    pub cost_analysis: Option<CostAnalysis>,
    pub hourly_rate: Option<f64>,
    pub comments: Vec<Comment>,
    pub collaborators: Vec<String>,
    /// Incremented by exactly one on every successful update; never decreases.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowSubmission {
    /// A new version-1 submission with the given display fields.
    pub fn new(
        name: impl Into<String>,
        business_name: impl Into<String>,
        department_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            business_name: business_name.into(),
            department_name: department_name.into(),
            questions: Vec::new(),
            steps: Vec::new(),
            graph: None,
            is_linear: true,
            analysis: None,
            recommendations: Vec::new(),
            tools: Vec::new(),
            cost_analysis: None,
            hourly_rate: None,
            comments: Vec::new(),
            collaborators: Vec::new(),
            version: 1,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Append a comment unless one with the same id is already present.
    ///
    /// Returns `false` for duplicates, which makes comment delivery
    /// idempotent under at-least-once event semantics.
    pub fn push_comment(&mut self, comment: Comment) -> bool {
        if self.comments.iter().any(|c| c.id == comment.id) {
            return false;
        }
        self.comments.push(comment);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Editor,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaborationMode {
    Realtime,
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub theme: Theme,
    pub notifications: bool,
    pub collaboration_mode: CollaborationMode,
}

/// Partial update for [`UserPreferences`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferencesPatch {
    pub theme: Option<Theme>,
    pub notifications: Option<bool>,
    pub collaboration_mode: Option<CollaborationMode>,
}

impl UserPreferences {
    pub fn apply(&mut self, patch: PreferencesPatch) {
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(notifications) = patch.notifications {
            self.notifications = notifications;
        }
        if let Some(mode) = patch.collaboration_mode {
            self.collaboration_mode = mode;
        }
    }
}

/// The locally signed-in user. Persisted under `user/profile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub role: UserRole,
    pub preferences: UserPreferences,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            id: "default-user".to_string(),
            name: "Guest".to_string(),
            email: "guest@example.com".to_string(),
            avatar: None,
            role: UserRole::Admin,
            preferences: UserPreferences {
                theme: Theme::Dark,
                notifications: true,
                collaboration_mode: CollaborationMode::Realtime,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> CommentAuthor {
        CommentAuthor {
            id: Uuid::new_v4(),
            name: "Ada".into(),
            avatar: None,
            color: "#FF5733".into(),
        }
    }

    #[test]
    fn test_default_questionnaire() {
        let questions = default_questions();
        assert_eq!(questions.len(), 16);
        assert_eq!(questions[0].id, "q1");
        assert_eq!(questions[15].id, "q16");
        assert!(questions.iter().all(|q| q.answer.is_empty()));
    }

    #[test]
    fn test_new_submission_starts_at_version_one() {
        let sub = WorkflowSubmission::new("Invoices", "Acme Corp", "Finance");
        assert_eq!(sub.version, 1);
        assert!(sub.is_linear);
        assert!(sub.updated_at.is_none());
    }

    #[test]
    fn test_push_comment_is_idempotent() {
        let mut sub = WorkflowSubmission::new("Invoices", "Acme Corp", "Finance");
        let comment = CommentDraft::new("looks good").into_comment(author());

        assert!(sub.push_comment(comment.clone()));
        assert!(!sub.push_comment(comment));
        assert_eq!(sub.comments.len(), 1);
    }

    #[test]
    fn test_preferences_patch() {
        let mut profile = UserProfile::default();
        profile.preferences.apply(PreferencesPatch {
            theme: Some(Theme::Light),
            ..PreferencesPatch::default()
        });
        assert_eq!(profile.preferences.theme, Theme::Light);
        assert!(profile.preferences.notifications);
    }

    #[test]
    fn test_step_status_wire_names() {
        let json = serde_json::to_string(&StepStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }
}
