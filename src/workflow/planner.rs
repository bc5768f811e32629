//! Execution Planner
//!
//! Tracks per-step status during one execution:
//! - Dependency readiness
//! - Partitioning of ready steps into parallel and sequential groups
//! - Result ordering by dependency level

use std::collections::HashMap;

use log::{debug, info};

use super::model::{Step, Workflow};
use super::state::ExecutionState;
use super::validator::compute_levels;

/// Status of a workflow step during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Step is waiting for dependencies
    Pending,
    /// Step is currently executing
    Running,
    /// Step finished (optional failures included)
    Completed,
    /// Step failed and the failure is fatal
    Failed,
}

/// A step as tracked by the plan.
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    /// ID of the step
    pub step_id: String,
    /// Executor registry key
    pub executor: String,
    /// IDs the step waits for
    pub dependencies: Vec<String>,
    /// Current status
    pub status: StepStatus,
}

/// Ready steps split by their `parallel` flag.
#[derive(Debug, Clone, Default)]
pub struct ReadyGroups {
    /// Steps dispatched as one bounded fork-join group
    pub parallel: Vec<Step>,
    /// Steps run one at a time, in declaration order
    pub sequential: Vec<Step>,
}

impl ReadyGroups {
    /// Returns true if nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.parallel.is_empty() && self.sequential.is_empty()
    }

    /// Total number of ready steps.
    pub fn len(&self) -> usize {
        self.parallel.len() + self.sequential.len()
    }
}

/// Manages execution planning and step status.
///
/// Built fresh for every execute or resume call; resumed executions mark
/// their checkpointed steps completed via [`ExecutionPlan::from_state`].
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// ID of the planned workflow
    workflow_id: String,
    /// Step definitions, declaration order
    definitions: Vec<Step>,
    /// Tracked steps, declaration order
    steps: Vec<ExecutionStep>,
    /// Step ID -> position in `steps`
    index: HashMap<String, usize>,
    /// Resolver levels, used for result ordering
    levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Creates a new execution plan for a validated workflow.
    pub fn new(workflow: &Workflow) -> Self {
        let steps: Vec<ExecutionStep> = workflow
            .steps
            .iter()
            .map(|step| ExecutionStep {
                step_id: step.id.clone(),
                executor: step.executor.clone(),
                dependencies: step.depends_on.clone(),
                status: StepStatus::Pending,
            })
            .collect();

        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.clone(), i))
            .collect();

        let levels = compute_levels(&workflow.steps);

        info!(
            "Planned workflow '{}': {} steps in {} levels",
            workflow.id,
            steps.len(),
            levels.len()
        );

        Self {
            workflow_id: workflow.id.clone(),
            definitions: workflow.steps.clone(),
            steps,
            index,
            levels,
        }
    }

    /// Creates a plan that resumes from a checkpoint.
    pub fn from_state(workflow: &Workflow, state: &ExecutionState) -> Self {
        let mut plan = Self::new(workflow);

        for step_id in &state.completed_steps {
            if plan.index.contains_key(step_id) {
                plan.set_status(step_id, StepStatus::Completed);
                info!("Skipping previously completed step: {}", step_id);
            } else {
                debug!("Checkpoint names unknown step '{}', ignoring", step_id);
            }
        }

        plan
    }

    /// Returns the ID of the planned workflow.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Returns the tracked steps in declaration order.
    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    /// Returns the status of a step.
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.index.get(step_id).map(|&i| self.steps[i].status)
    }

    /// Returns pending steps whose dependencies have all completed.
    pub fn ready_steps(&self) -> Vec<Step> {
        self.steps
            .iter()
            .zip(&self.definitions)
            .filter(|(tracked, _)| tracked.status == StepStatus::Pending)
            .filter(|(tracked, _)| {
                tracked
                    .dependencies
                    .iter()
                    .all(|dep| self.status(dep) == Some(StepStatus::Completed))
            })
            .map(|(_, step)| step.clone())
            .collect()
    }

    /// Returns the ready steps split by their own `parallel` flag.
    pub fn ready_groups(&self) -> ReadyGroups {
        let (parallel, sequential): (Vec<Step>, Vec<Step>) =
            self.ready_steps().into_iter().partition(|s| s.parallel);
        ReadyGroups {
            parallel,
            sequential,
        }
    }

    /// Marks a step as running.
    pub fn mark_running(&mut self, step_id: &str) {
        self.set_status(step_id, StepStatus::Running);
    }

    /// Marks a step as completed.
    pub fn mark_completed(&mut self, step_id: &str) {
        self.set_status(step_id, StepStatus::Completed);
    }

    /// Marks a step as failed.
    pub fn mark_failed(&mut self, step_id: &str) {
        self.set_status(step_id, StepStatus::Failed);
    }

    /// Returns true once every step has completed.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Returns the IDs of steps that have not completed.
    pub fn incomplete_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Completed)
            .map(|s| s.step_id.clone())
            .collect()
    }

    /// Returns the current progress as (completed, total).
    pub fn progress(&self) -> (usize, usize) {
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (completed, self.steps.len())
    }

    /// Returns step IDs ordered by dependency level, then declaration order.
    pub fn result_order(&self) -> Vec<&str> {
        self.levels.iter().flatten().map(String::as_str).collect()
    }

    fn set_status(&mut self, step_id: &str, status: StepStatus) {
        if let Some(&i) = self.index.get(step_id) {
            debug!("Step '{}': {:?} -> {:?}", step_id, self.steps[i].status, status);
            self.steps[i].status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::StepRecord;
    use serde_json::{json, Value};

    fn create_test_workflow() -> Workflow {
        Workflow::from_steps(
            "wf",
            vec![
                Step::new("a", "echo"),
                Step::new("b", "echo").parallel(),
                Step::new("c", "echo").depends_on("a").depends_on("b"),
            ],
        )
    }

    fn ids(steps: &[Step]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_plan_creation() {
        let plan = ExecutionPlan::new(&create_test_workflow());

        assert_eq!(plan.workflow_id(), "wf");
        assert_eq!(plan.progress(), (0, 3));
        assert!(plan.steps().iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(plan.steps()[2].dependencies, vec!["a", "b"]);
    }

    #[test]
    fn test_ready_steps_initial() {
        let plan = ExecutionPlan::new(&create_test_workflow());
        assert_eq!(ids(&plan.ready_steps()), vec!["a", "b"]);
    }

    #[test]
    fn test_ready_groups_partition_by_flag() {
        let plan = ExecutionPlan::new(&create_test_workflow());
        let groups = plan.ready_groups();

        assert_eq!(ids(&groups.parallel), vec!["b"]);
        assert_eq!(ids(&groups.sequential), vec!["a"]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_running_step_not_ready() {
        let mut plan = ExecutionPlan::new(&create_test_workflow());
        plan.mark_running("a");

        assert_eq!(ids(&plan.ready_steps()), vec!["b"]);
        assert_eq!(plan.status("a"), Some(StepStatus::Running));
    }

    #[test]
    fn test_dependent_ready_after_all_dependencies() {
        let mut plan = ExecutionPlan::new(&create_test_workflow());

        plan.mark_completed("a");
        assert_eq!(ids(&plan.ready_steps()), vec!["b"]);

        plan.mark_completed("b");
        assert_eq!(ids(&plan.ready_steps()), vec!["c"]);
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let mut plan = ExecutionPlan::new(&create_test_workflow());
        plan.mark_completed("a");
        plan.mark_failed("b");

        assert!(plan.ready_steps().is_empty());
        assert_eq!(plan.incomplete_steps(), vec!["b", "c"]);
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_is_complete() {
        let mut plan = ExecutionPlan::new(&create_test_workflow());
        for id in ["a", "b", "c"] {
            plan.mark_completed(id);
        }
        assert!(plan.is_complete());
        assert_eq!(plan.progress(), (3, 3));
    }

    #[test]
    fn test_plan_from_state() {
        let workflow = create_test_workflow();
        let mut state = ExecutionState::new("exec", "wf", 3, Value::Null);
        state.mark_completed(StepRecord::success("a", json!(1), 1, 1));
        state.mark_completed(StepRecord::success("ghost", json!(1), 1, 1));

        let plan = ExecutionPlan::from_state(&workflow, &state);

        assert_eq!(plan.progress(), (1, 3));
        assert_eq!(ids(&plan.ready_steps()), vec!["b"]);
    }

    #[test]
    fn test_result_order_follows_levels() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![
                Step::new("report", "echo").depends_on("fetch"),
                Step::new("fetch", "echo"),
                Step::new("notes", "echo"),
            ],
        );

        let plan = ExecutionPlan::new(&workflow);
        assert_eq!(plan.result_order(), vec!["fetch", "notes", "report"]);
    }

    #[test]
    fn test_unknown_step_ignored() {
        let mut plan = ExecutionPlan::new(&create_test_workflow());
        plan.mark_completed("nope");
        assert_eq!(plan.progress(), (0, 3));
        assert_eq!(plan.status("nope"), None);
    }
}
