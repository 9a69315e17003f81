//! Cost and ROI projection.

use serde::{Deserialize, Serialize};

use crate::model::WorkflowStep;

/// Executions per period used for the savings projection
/// (40 per week, 4 weeks per month, 3 months per quarter, 4 quarters per year).
pub const TASKS_PER_WEEK: f64 = 40.0;
pub const TASKS_PER_MONTH: f64 = 160.0;
pub const TASKS_PER_QUARTER: f64 = 480.0;
pub const TASKS_PER_YEAR: f64 = 1920.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub manual_workflow_cost: f64,
    pub ai_assisted_workflow_cost: f64,
    pub net_savings_per_task: f64,
    pub weekly_savings: f64,
    pub monthly_savings: f64,
    pub quarterly_savings: f64,
    pub yearly_savings: f64,
}

impl CostAnalysis {
    /// Project savings from the per-execution manual and AI-assisted cost.
    pub fn from_per_task(manual: f64, ai_assisted: f64) -> Self {
        let net = manual - ai_assisted;
        Self {
            manual_workflow_cost: manual,
            ai_assisted_workflow_cost: ai_assisted,
            net_savings_per_task: net,
            weekly_savings: net * TASKS_PER_WEEK,
            monthly_savings: net * TASKS_PER_MONTH,
            quarterly_savings: net * TASKS_PER_QUARTER,
            yearly_savings: net * TASKS_PER_YEAR,
        }
    }

    /// Sum the per-step estimates. Steps without an estimate count as zero.
    pub fn from_steps(steps: &[WorkflowStep]) -> Self {
        let manual = steps.iter().filter_map(|s| s.manual_cost).sum();
        let ai = steps.iter().filter_map(|s| s.ai_assisted_cost).sum();
        Self::from_per_task(manual, ai)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_projection_multipliers() {
        let cost = CostAnalysis::from_per_task(25.0, 0.52);
        assert!(close(cost.net_savings_per_task, 24.48));
        assert!(close(cost.weekly_savings, 979.2));
        assert!(close(cost.monthly_savings, 3916.8));
        assert!(close(cost.quarterly_savings, 11750.4));
        assert!(close(cost.yearly_savings, 47001.6));
    }

    #[test]
    fn test_from_steps_skips_missing_estimates() {
        let mut a = WorkflowStep::new("a", "A", "");
        a.manual_cost = Some(10.0);
        a.ai_assisted_cost = Some(1.0);
        let b = WorkflowStep::new("b", "B", "");

        let cost = CostAnalysis::from_steps(&[a, b]);
        assert!(close(cost.manual_workflow_cost, 10.0));
        assert!(close(cost.net_savings_per_task, 9.0));
    }
}
