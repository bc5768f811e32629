//! Workflow Validation
//!
//! Dependency resolution for workflow structures:
//! - Step field validation
//! - Reference integrity checking
//! - Cycle detection (depth-first search with a recursion stack)
//! - Level partitioning for scheduling order

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use thiserror::Error;

use super::model::{Step, Workflow};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Workflow has empty or whitespace-only ID")]
    EmptyWorkflowId,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Step '{0}' has no agent specified")]
    EmptyExecutor(String),

    #[error("Step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Step '{step}' references unknown step '{reference}'")]
    InvalidReference { step: String, reference: String },

    #[error("Step '{0}': retryPolicy.maxAttempts must be at least 1")]
    ZeroAttempts(String),

    #[error("Step '{0}': timeout must be greater than zero")]
    ZeroTimeout(String),

    #[error("config.maxConcurrent must be at least 1")]
    ZeroConcurrency,

    #[error("Workflow contains cyclic dependencies: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Step IDs named by this error.
    pub fn step_ids(&self) -> Vec<String> {
        match self {
            Self::DuplicateStepId(id)
            | Self::EmptyExecutor(id)
            | Self::SelfDependency(id)
            | Self::ZeroAttempts(id)
            | Self::ZeroTimeout(id) => vec![id.clone()],
            Self::InvalidReference { step, reference } => vec![step.clone(), reference.clone()],
            Self::CyclicDependency(cycle) => cycle.clone(),
            Self::Multiple(errors) => errors.iter().flat_map(|e| e.step_ids()).collect(),
            Self::EmptyWorkflow | Self::EmptyWorkflowId | Self::EmptyStepId | Self::ZeroConcurrency => {
                Vec::new()
            }
        }
    }

    fn from_many(mut errors: Vec<ValidationError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Multiple(errors)
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors; // Can't validate further without ID
    }

    if step.executor.trim().is_empty() {
        errors.push(ValidationError::EmptyExecutor(step.id.clone()));
    }

    if step.depends_on.iter().any(|dep| *dep == step.id) {
        errors.push(ValidationError::SelfDependency(step.id.clone()));
    }

    if step.retry_policy.max_attempts == 0 {
        errors.push(ValidationError::ZeroAttempts(step.id.clone()));
    }

    if step.timeout == 0 {
        errors.push(ValidationError::ZeroTimeout(step.id.clone()));
    }

    if step.depends_on.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.id);
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. Workflow has an ID and at least one step
/// 2. No duplicate step IDs
/// 3. All steps have valid fields
/// 4. All dependencies point to existing steps
/// 5. No cyclic dependencies
///
/// Field and reference problems are reported together. Cycle detection only
/// runs once every reference resolves.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationError> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );

    if workflow.id.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowId);
    }

    if workflow.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut all_errors = Vec::new();

    if workflow.config.max_concurrent == 0 {
        all_errors.push(ValidationError::ZeroConcurrency);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            all_errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        all_errors.extend(validate_step(step));

        for dep in &step.depends_on {
            if *dep != step.id && !seen_ids.contains(dep.as_str()) {
                all_errors.push(ValidationError::InvalidReference {
                    step: step.id.clone(),
                    reference: dep.clone(),
                });
            }
        }
    }

    if !all_errors.is_empty() {
        return Err(ValidationError::from_many(all_errors));
    }

    if let Some(cycle) = find_cycle(&workflow.steps) {
        return Err(ValidationError::CyclicDependency(cycle));
    }

    info!(
        "Workflow '{}' validated: {} steps, {} agents",
        workflow.id,
        workflow.steps.len(),
        workflow.executors().len()
    );
    Ok(())
}

/// Visit state for the depth-first cycle search.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Finds a dependency cycle, returning the step IDs along it.
///
/// The returned path starts and ends with the same step ID, e.g.
/// `["a", "b", "a"]`. Steps are visited in declaration order, so the
/// reported cycle is deterministic.
pub fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..steps.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, steps, &index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }

    None
}

fn visit(
    node: usize,
    steps: &[Step],
    index: &HashMap<&str, usize>,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<String>> {
    marks[node] = Mark::OnStack;
    stack.push(node);

    for dep in &steps[node].depends_on {
        let Some(&next) = index.get(dep.as_str()) else {
            continue;
        };

        match marks[next] {
            Mark::OnStack => {
                let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> = stack[from..]
                    .iter()
                    .map(|&n| steps[n].id.clone())
                    .collect();
                cycle.push(steps[next].id.clone());
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, steps, index, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Done;
    None
}

/// Partitions steps into dependency levels.
///
/// A step lands in the earliest level whose predecessors contain all of
/// its dependencies. Within a level, declaration order is preserved.
/// Dependencies on unknown IDs are ignored; steps caught in a cycle are
/// left out, which cannot happen for a validated workflow.
pub fn compute_levels(steps: &[Step]) -> Vec<Vec<String>> {
    let known: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut level_of: HashMap<&str, usize> = HashMap::new();
    let mut remaining: Vec<&Step> = steps.iter().collect();

    loop {
        let before = remaining.len();

        remaining.retain(|&step| {
            let mut level = 0;
            for dep in step.depends_on.iter().filter(|d| known.contains(d.as_str())) {
                match level_of.get(dep.as_str()) {
                    Some(dep_level) => level = level.max(dep_level + 1),
                    None => return true,
                }
            }
            level_of.insert(step.id.as_str(), level);
            false
        });

        if remaining.is_empty() || remaining.len() == before {
            break;
        }
    }

    let depth = level_of.values().copied().max().map_or(0, |max| max + 1);
    let mut levels: Vec<Vec<String>> = vec![Vec::new(); depth];

    for step in steps {
        if let Some(&level) = level_of.get(step.id.as_str()) {
            levels[level].push(step.id.clone());
        }
    }

    debug!("Computed {} dependency levels", levels.len());
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Workflow {
        Workflow::from_steps(
            "diamond",
            vec![
                Step::new("a", "echo"),
                Step::new("b", "echo").depends_on("a"),
                Step::new("c", "echo").depends_on("a"),
                Step::new("d", "echo").depends_on("b").depends_on("c"),
            ],
        )
    }

    #[test]
    fn test_valid_workflow() {
        assert!(validate_workflow(&diamond()).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let workflow = Workflow::new("empty");
        assert_eq!(validate_workflow(&workflow), Err(ValidationError::EmptyWorkflow));
    }

    #[test]
    fn test_empty_workflow_id() {
        let workflow = Workflow::from_steps("  ", vec![Step::new("a", "echo")]);
        assert_eq!(validate_workflow(&workflow), Err(ValidationError::EmptyWorkflowId));
    }

    #[test]
    fn test_duplicate_ids() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![Step::new("same_id", "echo"), Step::new("same_id", "echo")],
        );

        let err = validate_workflow(&workflow).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateStepId("same_id".to_string()));
    }

    #[test]
    fn test_cyclic_dependency_names_steps() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![
                Step::new("a", "echo").depends_on("b"),
                Step::new("b", "echo").depends_on("a"),
            ],
        );

        let err = validate_workflow(&workflow).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CyclicDependency(vec!["a".into(), "b".into(), "a".into()])
        );
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_longer_cycle_behind_valid_prefix() {
        let steps = vec![
            Step::new("root", "echo"),
            Step::new("x", "echo").depends_on("root").depends_on("z"),
            Step::new("y", "echo").depends_on("x"),
            Step::new("z", "echo").depends_on("y"),
        ];

        let cycle = find_cycle(&steps).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        for id in ["x", "y", "z"] {
            assert!(cycle.contains(&id.to_string()));
        }
        assert!(!cycle.contains(&"root".to_string()));
    }

    #[test]
    fn test_no_cycle_in_diamond() {
        assert!(find_cycle(&diamond().steps).is_none());
    }

    #[test]
    fn test_self_dependency() {
        let workflow = Workflow::from_steps("wf", vec![Step::new("a", "echo").depends_on("a")]);
        assert_eq!(
            validate_workflow(&workflow),
            Err(ValidationError::SelfDependency("a".to_string()))
        );
    }

    #[test]
    fn test_validate_invalid_reference() {
        let workflow = Workflow::from_steps("wf", vec![Step::new("step1", "echo").depends_on("ghost")]);

        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
        assert_eq!(err.step_ids(), vec!["step1", "ghost"]);
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut bad = Step::new("b", "");
        bad.retry_policy.max_attempts = 0;
        let workflow = Workflow::from_steps("wf", vec![Step::new("a", "echo").depends_on("ghost"), bad]);

        match validate_workflow(&workflow).unwrap_err() {
            ValidationError::Multiple(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(errors.contains(&ValidationError::EmptyExecutor("b".into())));
                assert!(errors.contains(&ValidationError::ZeroAttempts("b".into())));
            }
            other => panic!("Expected Multiple, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut workflow = diamond();
        workflow.config.max_concurrent = 0;
        assert_eq!(validate_workflow(&workflow), Err(ValidationError::ZeroConcurrency));
    }

    #[test]
    fn test_validate_step_empty_id() {
        let step = Step::new("", "echo");
        let errors = validate_step(&step);
        assert_eq!(errors, vec![ValidationError::EmptyStepId]);
    }

    #[test]
    fn test_validate_step_zero_timeout() {
        let mut step = Step::new("slow", "echo");
        step.timeout = 0;
        assert_eq!(validate_step(&step), vec![ValidationError::ZeroTimeout("slow".into())]);
    }

    #[test]
    fn test_compute_levels_diamond() {
        let levels = compute_levels(&diamond().steps);
        assert_eq!(
            levels,
            vec![vec!["a".to_string()], vec!["b".into(), "c".into()], vec!["d".into()]]
        );
    }

    #[test]
    fn test_compute_levels_preserves_declaration_order() {
        let steps = vec![
            Step::new("late", "echo").depends_on("first"),
            Step::new("z", "echo"),
            Step::new("first", "echo"),
            Step::new("m", "echo"),
        ];

        let levels = compute_levels(&steps);
        assert_eq!(levels[0], vec!["z", "first", "m"]);
        assert_eq!(levels[1], vec!["late"]);
    }

    #[test]
    fn test_compute_levels_uses_longest_path() {
        let steps = vec![
            Step::new("a", "echo"),
            Step::new("b", "echo").depends_on("a"),
            Step::new("c", "echo").depends_on("a").depends_on("b"),
        ];

        let levels = compute_levels(&steps);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[2], vec!["c"]);
    }

    #[test]
    fn test_compute_levels_empty() {
        assert!(compute_levels(&[]).is_empty());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::EmptyWorkflow;
        assert_eq!(err.to_string(), "Workflow has no steps");

        let err = ValidationError::DuplicateStepId("test".to_string());
        assert!(err.to_string().contains("test"));

        let err = ValidationError::Multiple(vec![
            ValidationError::EmptyExecutor("x".into()),
            ValidationError::ZeroTimeout("y".into()),
        ]);
        assert_eq!(err.to_string().lines().count(), 2);
    }
}
