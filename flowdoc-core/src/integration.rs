//! Third-party integrations a workflow can be handed to.
//!
//! Each kind comes with a template: a display name and the settings it
//! expects. Creating an integration starts from the template and layers the
//! caller's settings on top; updates merge settings the same way.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Zapier,
    Make,
    Ifttt,
    Slack,
    Trello,
    Asana,
    Github,
    GoogleWorkspace,
    #[serde(rename = "microsoft_365")]
    Microsoft365,
    Airtable,
    Notion,
    Jira,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 12] = [
        IntegrationKind::Zapier,
        IntegrationKind::Make,
        IntegrationKind::Ifttt,
        IntegrationKind::Slack,
        IntegrationKind::Trello,
        IntegrationKind::Asana,
        IntegrationKind::Github,
        IntegrationKind::GoogleWorkspace,
        IntegrationKind::Microsoft365,
        IntegrationKind::Airtable,
        IntegrationKind::Notion,
        IntegrationKind::Jira,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Zapier => "zapier",
            IntegrationKind::Make => "make",
            IntegrationKind::Ifttt => "ifttt",
            IntegrationKind::Slack => "slack",
            IntegrationKind::Trello => "trello",
            IntegrationKind::Asana => "asana",
            IntegrationKind::Github => "github",
            IntegrationKind::GoogleWorkspace => "google_workspace",
            IntegrationKind::Microsoft365 => "microsoft_365",
            IntegrationKind::Airtable => "airtable",
            IntegrationKind::Notion => "notion",
            IntegrationKind::Jira => "jira",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            IntegrationKind::Zapier => "Zapier",
            IntegrationKind::Make => "Make (Integromat)",
            IntegrationKind::Ifttt => "IFTTT",
            IntegrationKind::Slack => "Slack",
            IntegrationKind::Trello => "Trello",
            IntegrationKind::Asana => "Asana",
            IntegrationKind::Github => "GitHub",
            IntegrationKind::GoogleWorkspace => "Google Workspace",
            IntegrationKind::Microsoft365 => "Microsoft 365",
            IntegrationKind::Airtable => "Airtable",
            IntegrationKind::Notion => "Notion",
            IntegrationKind::Jira => "Jira",
        }
    }

    /// Settings the template starts out with, all empty.
    pub fn template_fields(&self) -> &'static [&'static str] {
        match self {
            IntegrationKind::Zapier | IntegrationKind::Make => &["apiKey", "webhookUrl"],
            IntegrationKind::Ifttt => &["webhookKey"],
            IntegrationKind::Slack => &["apiToken", "channel"],
            IntegrationKind::Trello => &["apiKey", "token", "boardId"],
            IntegrationKind::Asana => &["accessToken", "workspaceId", "projectId"],
            IntegrationKind::Github => &["accessToken", "owner", "repo"],
            IntegrationKind::GoogleWorkspace => &["clientId", "clientSecret", "refreshToken"],
            IntegrationKind::Microsoft365 => &["clientId", "clientSecret", "tenantId"],
            IntegrationKind::Airtable => &["apiKey", "baseId"],
            IntegrationKind::Notion => &["apiKey", "databaseId"],
            IntegrationKind::Jira => &["apiToken", "domain", "email", "projectKey"],
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationKind {
    type Err = IntegrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| IntegrationError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrationError {
    #[error("unknown integration type: {0}")]
    UnknownKind(String),
    #[error("integration not found: {0}")]
    NotFound(Uuid),
    #[error("integration is disabled: {0}")]
    Disabled(String),
    #[error("no active workflow")]
    NoActiveWorkflow,
}

/// A configured integration. Persisted under `integrations/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub id: Uuid,
    pub name: String,
    pub kind: IntegrationKind,
    pub settings: BTreeMap<String, String>,
    pub enabled: bool,
    pub last_synced: Option<DateTime<Utc>>,
}

impl IntegrationConfig {
    /// A new, enabled integration built from the kind's template.
    pub fn from_template(kind: IntegrationKind, settings: BTreeMap<String, String>) -> Self {
        let mut merged: BTreeMap<String, String> = kind
            .template_fields()
            .iter()
            .map(|field| (field.to_string(), String::new()))
            .collect();
        merged.extend(settings);
        Self {
            id: Uuid::new_v4(),
            name: kind.display_name().to_string(),
            kind,
            settings: merged,
            enabled: true,
            last_synced: None,
        }
    }

    pub fn apply(&mut self, patch: IntegrationPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        self.settings.extend(patch.settings);
    }
}

/// Partial update; `settings` are merged key by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub settings: BTreeMap<String, String>,
}

/// What an executed integration action reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationRun {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub workflow_id: Uuid,
    pub action: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
