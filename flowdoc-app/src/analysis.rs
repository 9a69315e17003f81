//! Analysis generation for submitted questionnaires.
//!
//! The remote generator is a seam: anything implementing
//! [`AnalysisGenerator`] can be plugged into the store. [`LocalAnalysis`]
//! produces the built-in five-step plan, and [`FallbackGenerator`] uses it
//! whenever the primary generator cannot be reached or returns garbage, so
//! the user always gets a result.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowdoc_core::{CostAnalysis, ToolRecommendation, WorkflowQuestion, WorkflowStep};

/// Used when no rate can be read from the answers.
pub const DEFAULT_HOURLY_RATE: f64 = 50.0;
/// 40 hours a week, 52 weeks a year.
pub const WORK_HOURS_PER_YEAR: f64 = 2080.0;
/// Rates above this are taken to be annual salaries.
const ANNUAL_SALARY_THRESHOLD: f64 = 100.0;

const MANUAL_COST_PER_TASK: f64 = 25.0;
const AI_ASSISTED_COST_PER_TASK: f64 = 0.52;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub analysis: String,
    pub recommendations: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    pub cost_analysis: CostAnalysis,
    pub tools: Vec<ToolRecommendation>,
    pub hourly_rate: f64,
    /// Produced by the local fallback instead of the requested generator.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("analysis service unreachable: {0}")]
    Network(String),

    #[error("malformed analysis response: {0}")]
    Parse(String),

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait AnalysisGenerator: Send + Sync {
    async fn generate(&self, questions: &[WorkflowQuestion]) -> Result<AnalysisResponse, AnalysisError>;
}

struct StepTemplate {
    name: &'static str,
    description: &'static str,
    minutes: f64,
    tools: [&'static str; 2],
    instructions: &'static str,
}

const DEFAULT_PLAN: [StepTemplate; 5] = [
    StepTemplate {
        name: "Task Identification and Initiation",
        description: "Identify tasks and initiate the workflow",
        minutes: 15.0,
        tools: ["Zapier", "Make"],
        instructions: "Connect the apps involved with a visual automation builder so every run starts from the same trigger.",
    },
    StepTemplate {
        name: "Data Collection",
        description: "Collect data from various sources",
        minutes: 30.0,
        tools: ["Otter.ai", "Pipefy"],
        instructions: "Transcribe meetings into searchable text and replace ad-hoc data entry with standard forms.",
    },
    StepTemplate {
        name: "Data Processing",
        description: "Process collected data",
        minutes: 45.0,
        tools: ["Workato", "Appy Pie Automate"],
        instructions: "Map incoming fields once and route exceptions through conditional automation paths.",
    },
    StepTemplate {
        name: "Task Assignment",
        description: "Assign tasks to team members",
        minutes: 20.0,
        tools: ["Artwork Flow", "Pulpstream"],
        instructions: "Set up rule-based assignment so work reaches the right owner without a manual hand-off.",
    },
    StepTemplate {
        name: "Task Completion and Review",
        description: "Monitor task completion and review",
        minutes: 25.0,
        tools: ["Zapier", "Appy Pie Automate"],
        instructions: "Trigger completion notifications and push status updates back to the system of record.",
    },
];

/// Built-in generator. Deterministic and offline.
#[derive(Debug, Clone, Default)]
pub struct LocalAnalysis;

impl LocalAnalysis {
    pub fn new() -> Self {
        Self
    }

    /// The analysis for `questions`, computed synchronously.
    pub fn analyze(&self, questions: &[WorkflowQuestion]) -> AnalysisResponse {
        let workflow = questions
            .first()
            .map(|q| q.answer.trim())
            .filter(|a| !a.is_empty())
            .unwrap_or("workflow");

        let steps: Vec<WorkflowStep> = DEFAULT_PLAN
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut step = WorkflowStep::new(format!("step{}", i + 1), t.name, t.description);
                step.time_estimate = Some(t.minutes);
                step.manual_cost = Some(MANUAL_COST_PER_TASK);
                step.ai_assisted_cost = Some(AI_ASSISTED_COST_PER_TASK);
                step.tools = t.tools.iter().map(|s| s.to_string()).collect();
                step.instructions = Some(t.instructions.to_string());
                step
            })
            .collect();

        let tools: Vec<ToolRecommendation> = {
            let mut seen = BTreeSet::new();
            steps
                .iter()
                .flat_map(|step| step.tools.iter().map(move |tool| (tool, &step.name)))
                .filter(|(tool, _)| seen.insert(tool.to_string()))
                .map(|(tool, step)| ToolRecommendation {
                    name: tool.clone(),
                    description: format!("Suggested for {step}"),
                    cost: None,
                })
                .collect()
        };

        AnalysisResponse {
            analysis: format!(
                "The {workflow} process was broken down into five stages. Identification, \
                 collection and processing are mostly manual today and are the best candidates \
                 for automation; assignment and review benefit from rule-based routing."
            ),
            recommendations: vec![
                format!("Consider using AI to automate the repetitive tasks in {workflow}"),
                "Implement a centralized data storage solution to reduce manual data entry".into(),
                "Use workflow automation tools to streamline approval processes".into(),
                "Integrate AI-powered analytics to identify further optimization opportunities".into(),
                "Establish clear metrics to measure the success of your automation efforts".into(),
            ],
            steps,
            cost_analysis: CostAnalysis::from_per_task(MANUAL_COST_PER_TASK, AI_ASSISTED_COST_PER_TASK),
            tools,
            hourly_rate: hourly_rate_from(questions).unwrap_or(DEFAULT_HOURLY_RATE),
            degraded: false,
        }
    }
}

#[async_trait]
impl AnalysisGenerator for LocalAnalysis {
    async fn generate(&self, questions: &[WorkflowQuestion]) -> Result<AnalysisResponse, AnalysisError> {
        Ok(self.analyze(questions))
    }
}

/// Tries `primary`, substituting [`LocalAnalysis`] on network and parse
/// failures. Substituted results have `degraded` set.
pub struct FallbackGenerator {
    primary: Arc<dyn AnalysisGenerator>,
    local: LocalAnalysis,
}

impl FallbackGenerator {
    pub fn new(primary: Arc<dyn AnalysisGenerator>) -> Self {
        Self {
            primary,
            local: LocalAnalysis,
        }
    }
}

#[async_trait]
impl AnalysisGenerator for FallbackGenerator {
    async fn generate(&self, questions: &[WorkflowQuestion]) -> Result<AnalysisResponse, AnalysisError> {
        match self.primary.generate(questions).await {
            Ok(response) => Ok(response),
            Err(e @ (AnalysisError::Network(_) | AnalysisError::Parse(_))) => {
                log::warn!("analysis generator failed, using default steps: {e}");
                let mut response = self.local.analyze(questions);
                response.degraded = true;
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }
}

fn rate_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            // $120k | $52,000 | $40 / $40.50 | 40/hr, 40 / hour
            Regex::new(
                r"(?i)\$\s*(\d+)k\b|\$\s*(\d{1,3}(?:,\d{3})+)|\$\s*(\d+(?:\.\d+)?)|(\d+(?:\.\d+)?)\s*/\s*h(?:ou)?r",
            )
            .map_err(|e| log::error!("invalid rate pattern: {e}"))
            .ok()
        })
        .as_ref()
}

/// Read an hourly rate out of free text. Figures above 100 are treated as
/// annual salaries and divided by [`WORK_HOURS_PER_YEAR`].
pub fn extract_hourly_rate(text: &str) -> Option<f64> {
    let caps = rate_pattern()?.captures(text)?;

    let rate = if let Some(thousands) = caps.get(1) {
        thousands.as_str().parse::<f64>().ok()? * 1000.0
    } else if let Some(grouped) = caps.get(2) {
        grouped.as_str().replace(',', "").parse::<f64>().ok()?
    } else {
        caps.get(3).or_else(|| caps.get(4))?.as_str().parse::<f64>().ok()?
    };

    if rate > ANNUAL_SALARY_THRESHOLD {
        Some(rate / WORK_HOURS_PER_YEAR)
    } else {
        Some(rate)
    }
}

/// The rate from the first question asking about pay.
fn hourly_rate_from(questions: &[WorkflowQuestion]) -> Option<f64> {
    let question = questions.iter().find(|q| {
        let text = q.question.to_lowercase();
        ["salary", "cost", "hourly", "rate"].iter().any(|k| text.contains(k))
    })?;
    extract_hourly_rate(&question.answer)
}
