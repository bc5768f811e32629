//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow execution including:
//! - Dependency-ordered scheduling of steps
//! - Bounded fork-join of parallel steps
//! - Retries, timeouts and fail-fast cancellation
//! - A checkpoint after every finished step, for status queries and resume
//! - Cooperative pause between batches

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::resources::{BudgetTracker, Optimizer, SharedResources};
use crate::store::{Checkpointer, MemoryStateStore, StateStore};
use crate::workflow::{
    validate_workflow, ExecutionPlan, ExecutionState, ExecutionStatus, Step, StepRecord, Workflow,
    WorkflowStatus,
};

use super::executor::{Executor, ExecutorError, ExecutorRegistry, StepContext};
use super::retry::{execute_with_retry, StepOutcome};

/// Outcome of an `execute` or `resume` call that did not fail.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub workflow_id: String,
    /// `Completed`, or `Paused` if a pause was requested
    pub status: WorkflowStatus,
    /// Step results ordered by dependency level, then declaration order
    pub results: Vec<StepRecord>,
    /// Step timing of this call (empty when nothing ran)
    pub timeline: ExecutionTimeline,
}

impl ExecutionReport {
    /// Returns the result of a step.
    pub fn result(&self, step_id: &str) -> Option<&StepRecord> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    /// Returns the output of a step that succeeded.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.result(step_id).and_then(|r| r.output.as_ref())
    }

    /// IDs of the reported steps, in report order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.step_id.as_str()).collect()
    }
}

/// Workflow execution engine.
///
/// Owns the registered workflows, the executor registry, the shared
/// budget and optimizer, and the checkpointer. An engine is meant to be
/// shared (e.g. behind an `Arc`); all operations take `&self`.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use stepweaver::execution::{Engine, EchoExecutor};
/// use stepweaver::workflow::{Step, Workflow};
///
/// # async fn demo() -> Result<(), stepweaver::EngineError> {
/// let engine = Engine::new();
/// engine.register_executor("echo", Arc::new(EchoExecutor));
///
/// let workflow = Workflow::from_steps(
///     "hello",
///     vec![Step::new("greet", "echo").with_params(json!({"text": "hi"}))],
/// );
/// let report = engine.run_workflow(workflow, json!({})).await?;
/// assert_eq!(report.output("greet"), Some(&json!({"text": "hi"})));
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    workflows: RwLock<HashMap<String, Workflow>>,
    registry: ExecutorRegistry,
    checkpointer: Checkpointer,
    resources: SharedResources,
    /// Pause flags of running executions
    active: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Engine {
    /// Creates an engine with an in-memory store, an unlimited budget and
    /// a default-sized cache.
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            registry: ExecutorRegistry::new(),
            checkpointer: Checkpointer::new(Arc::new(MemoryStateStore::new())),
            resources: SharedResources::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the durable checkpoint store.
    pub fn with_state_store(self, store: Arc<dyn StateStore>) -> Self {
        self.with_checkpointer(Checkpointer::new(store))
    }

    /// Sets a preconfigured checkpointer.
    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    /// Sets the shared budget.
    pub fn with_budget(mut self, budget: Arc<BudgetTracker>) -> Self {
        self.resources.budget = budget;
        self
    }

    /// Sets the shared optimizer (and with it the cache).
    pub fn with_optimizer(mut self, optimizer: Arc<Optimizer>) -> Self {
        self.resources.optimizer = optimizer;
        self
    }

    /// Budget and optimizer handed to executors.
    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Registers the executor for an agent key.
    pub fn register_executor(&self, key: impl Into<String>, executor: Arc<dyn Executor>) {
        self.registry.register(key, executor);
    }

    /// Validates a workflow and registers it as `ready`.
    ///
    /// Replacing a workflow that is currently running is rejected.
    pub fn register_workflow(&self, mut workflow: Workflow) -> Result<(), EngineError> {
        validate_workflow(&workflow)?;

        let mut workflows = self.workflows_mut();
        if let Some(existing) = workflows.get(&workflow.id) {
            if existing.status == WorkflowStatus::Running {
                return Err(EngineError::WorkflowBusy(workflow.id));
            }
        }

        workflow.status = WorkflowStatus::Ready;
        info!(
            "Registered workflow '{}' v{} ({} steps)",
            workflow.id,
            workflow.version,
            workflow.len()
        );
        workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }

    /// Returns a copy of a registered workflow.
    pub fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows_ref().get(workflow_id).cloned()
    }

    /// Returns the lifecycle status of a registered workflow.
    pub fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.workflows_ref().get(workflow_id).map(|w| w.status)
    }

    /// Registers `workflow` and executes it.
    pub async fn run_workflow(&self, workflow: Workflow, context: Value) -> Result<ExecutionReport, EngineError> {
        let workflow_id = workflow.id.clone();
        self.register_workflow(workflow)?;
        self.execute(&workflow_id, context).await
    }

    /// Executes a registered workflow under a fresh execution ID.
    pub async fn execute(&self, workflow_id: &str, context: Value) -> Result<ExecutionReport, EngineError> {
        self.execute_with_id(workflow_id, Uuid::new_v4().to_string(), context)
            .await
    }

    /// Executes a registered workflow under a caller-chosen execution ID.
    ///
    /// Knowing the ID up front lets the caller [`pause`](Self::pause) or
    /// query the execution while it runs. An ID that is running or already
    /// has a checkpoint is rejected with [`EngineError::ExecutionExists`].
    pub async fn execute_with_id(
        &self,
        workflow_id: &str,
        execution_id: impl Into<String>,
        context: Value,
    ) -> Result<ExecutionReport, EngineError> {
        let execution_id = execution_id.into();
        let pause = self
            .reserve(&execution_id)
            .ok_or_else(|| EngineError::ExecutionExists(execution_id.clone()))?;

        let workflow = match self.prepare_new(workflow_id, &execution_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                self.active_map().remove(&execution_id);
                return Err(e);
            }
        };
        let state = ExecutionState::new(execution_id, &workflow.id, workflow.len(), context);

        info!(
            "Starting execution {} of '{}' (max concurrent: {}, fail fast: {})",
            state.execution_id, workflow.id, workflow.config.max_concurrent, workflow.config.fail_fast
        );

        self.run(workflow, state, pause).await
    }

    /// Continues an execution from its last checkpoint.
    ///
    /// Checkpointed steps are not run again; the step that was in flight
    /// when the checkpoint was taken runs again. Resuming a completed
    /// execution returns its recorded results.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        let mut state = self
            .checkpointer
            .load(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        let registered = self
            .workflow(&state.workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(state.workflow_id.clone()))?;

        if state.status == WorkflowStatus::Completed {
            info!("Execution {} already completed; nothing to resume", execution_id);
            let plan = ExecutionPlan::from_state(&registered, &state);
            return Ok(ExecutionReport {
                execution_id: state.execution_id.clone(),
                workflow_id: state.workflow_id.clone(),
                status: state.status,
                results: ordered_results(&plan, &state),
                timeline: ExecutionTimeline::new(),
            });
        }

        let Some(pause) = self.reserve(execution_id) else {
            return Err(EngineError::WorkflowBusy(state.workflow_id));
        };

        let workflow = match self.claim(&state.workflow_id) {
            Ok(workflow) => workflow,
            Err(e) => {
                self.active_map().remove(execution_id);
                return Err(e);
            }
        };
        info!(
            "Resuming execution {} of '{}' ({}/{} steps done)",
            execution_id,
            workflow.id,
            state.completed_steps.len(),
            workflow.len()
        );

        state.total_steps = workflow.len();
        state.set_status(WorkflowStatus::Running);
        self.run(workflow, state, pause).await
    }

    /// Asks a running execution to stop after its in-flight batch.
    pub fn pause(&self, execution_id: &str) -> Result<(), EngineError> {
        match self.active_map().get(execution_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!("Pause requested for execution {}", execution_id);
                Ok(())
            }
            None => Err(EngineError::ExecutionNotFound(execution_id.to_string())),
        }
    }

    /// IDs of executions currently running on this engine.
    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active_map().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reports the progress recorded in the latest checkpoint.
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionStatus, EngineError> {
        let state = self
            .checkpointer
            .load(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(ExecutionStatus::from(&state))
    }

    /// Returns the checkpoints of a workflow, newest first.
    pub async fn list_executions(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionState>, EngineError> {
        Ok(self.checkpointer.list(workflow_id, limit).await?)
    }

    /// Claims the pause flag slot of an execution ID, or `None` if it is
    /// already running.
    fn reserve(&self, execution_id: &str) -> Option<Arc<AtomicBool>> {
        let mut active = self.active_map();
        if active.contains_key(execution_id) {
            return None;
        }
        let pause = Arc::new(AtomicBool::new(false));
        active.insert(execution_id.to_string(), Arc::clone(&pause));
        Some(pause)
    }

    /// Checks that a new execution ID is unused, then claims the workflow.
    async fn prepare_new(&self, workflow_id: &str, execution_id: &str) -> Result<Workflow, EngineError> {
        match self.checkpointer.load(execution_id).await {
            Ok(Some(_)) => return Err(EngineError::ExecutionExists(execution_id.to_string())),
            Ok(None) => {}
            Err(e) => warn!("Could not check execution ID {} against the store: {}", execution_id, e),
        }
        self.claim(workflow_id)
    }

    /// Moves a registered workflow to `running` for a new execution.
    fn claim(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let mut workflows = self.workflows_mut();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        if workflow.status == WorkflowStatus::Running {
            return Err(EngineError::WorkflowBusy(workflow_id.to_string()));
        }

        validate_workflow(workflow)?;

        if !workflow.status.can_transition_to(WorkflowStatus::Running) {
            transition(workflow, WorkflowStatus::Ready);
        }
        transition(workflow, WorkflowStatus::Running);

        Ok(workflow.clone())
    }

    fn release(&self, workflow_id: &str, status: WorkflowStatus) {
        if let Some(workflow) = self.workflows_mut().get_mut(workflow_id) {
            transition(workflow, status);
        }
    }

    /// Drives an execution to completion, pause or failure.
    async fn run(
        &self,
        workflow: Workflow,
        state: ExecutionState,
        pause: Arc<AtomicBool>,
    ) -> Result<ExecutionReport, EngineError> {
        let mut run = Run {
            engine: self,
            plan: ExecutionPlan::from_state(&workflow, &state),
            input: Arc::new(state.context.clone()),
            workflow,
            state,
            timeline: ExecutionTimeline::new(),
            pause,
            cancel: CancellationToken::new(),
        };

        run.persist().await;
        let outcome = run.drive().await;

        self.active_map().remove(&run.state.execution_id);

        let status = match &outcome {
            Ok(WorkflowStatus::Paused) => {
                run.state.set_status(WorkflowStatus::Paused);
                let (done, total) = run.plan.progress();
                info!(
                    "Execution {} paused after {}/{} steps",
                    run.state.execution_id, done, total
                );
                WorkflowStatus::Paused
            }
            Ok(_) => {
                run.state.finish(WorkflowStatus::Completed, None);
                info!(
                    "Workflow '{}' completed in {:.2?} (execution {})",
                    run.workflow.id,
                    run.timeline.elapsed(),
                    run.state.execution_id
                );
                WorkflowStatus::Completed
            }
            Err(e) => {
                run.state.finish(WorkflowStatus::Failed, Some(e.to_string()));
                error!("Workflow '{}' failed: {}", run.workflow.id, e);
                WorkflowStatus::Failed
            }
        };

        run.persist().await;
        self.release(&run.workflow.id, status);
        debug!("{}", run.timeline.gantt_chart());

        outcome?;
        Ok(run.into_report())
    }

    fn active_map(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn workflows_ref(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Workflow>> {
        self.workflows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn workflows_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Workflow>> {
        self.workflows.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.workflows_ref().keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .field("active", &self.active_executions())
            .finish()
    }
}

fn transition(workflow: &mut Workflow, next: WorkflowStatus) {
    if workflow.status == next {
        return;
    }
    if workflow.status.can_transition_to(next) {
        debug!("Workflow '{}': {} -> {}", workflow.id, workflow.status, next);
        workflow.status = next;
    } else {
        warn!(
            "Ignoring invalid status change {} -> {} for workflow '{}'",
            workflow.status, next, workflow.id
        );
    }
}

/// Recorded results in plan order.
fn ordered_results(plan: &ExecutionPlan, state: &ExecutionState) -> Vec<StepRecord> {
    plan.result_order()
        .into_iter()
        .filter_map(|id| state.step_results.get(id).cloned())
        .collect()
}

/// Maps a terminal executor error to the engine error it causes.
fn step_error(step_id: &str, attempts: u32, error: ExecutorError) -> EngineError {
    let step_id = step_id.to_string();
    match error {
        ExecutorError::Budget(source) => EngineError::BudgetExceeded { step_id, source },
        ExecutorError::Cancelled => EngineError::Cancelled { step_id },
        source => EngineError::StepExecution {
            step_id,
            attempts,
            source,
        },
    }
}

/// Errors an optional step may not swallow.
fn always_fatal(error: &EngineError) -> bool {
    matches!(error, EngineError::BudgetExceeded { .. } | EngineError::Cancelled { .. })
}

/// How a step ended, as seen by the coordinator.
struct Settlement {
    result: Result<Value, EngineError>,
    attempts: u32,
    started: Option<Instant>,
    duration: Duration,
}

impl Settlement {
    fn from_outcome(step_id: &str, outcome: StepOutcome) -> Self {
        let attempts = outcome.attempts;
        Self {
            result: outcome.result.map_err(|e| step_error(step_id, attempts, e)),
            attempts,
            started: (attempts > 0).then_some(outcome.started),
            duration: outcome.duration,
        }
    }

    fn failed(error: EngineError) -> Self {
        Self {
            result: Err(error),
            attempts: 0,
            started: None,
            duration: Duration::ZERO,
        }
    }
}

/// State of one execute/resume call. Only this coordinator mutates the
/// plan and the checkpoint.
struct Run<'e> {
    engine: &'e Engine,
    workflow: Workflow,
    plan: ExecutionPlan,
    state: ExecutionState,
    timeline: ExecutionTimeline,
    input: Arc<Value>,
    pause: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<WorkflowStatus, EngineError> {
        while !self.plan.is_complete() {
            if self.pause_requested() {
                return Ok(WorkflowStatus::Paused);
            }

            let groups = self.plan.ready_groups();
            if groups.is_empty() {
                let steps = self.plan.incomplete_steps();
                error!("No tasks ready but workflow not complete: {:?}", steps);
                return Err(EngineError::CircularDependency { steps });
            }

            debug!(
                "Ready: {} parallel, {} sequential",
                groups.parallel.len(),
                groups.sequential.len()
            );

            if !groups.parallel.is_empty() {
                self.run_parallel(groups.parallel).await?;
            }

            for step in groups.sequential {
                if self.pause_requested() {
                    return Ok(WorkflowStatus::Paused);
                }
                self.run_sequential(step).await?;
            }
        }

        Ok(WorkflowStatus::Completed)
    }

    /// Runs ready parallel steps as one bounded fork-join group.
    async fn run_parallel(&mut self, steps: Vec<Step>) -> Result<(), EngineError> {
        let fail_fast = self.workflow.config.fail_fast;
        let mut fatal: Option<EngineError> = None;

        let mut dispatch = Vec::with_capacity(steps.len());
        for step in steps {
            match self.lookup(&step) {
                Ok(executor) => dispatch.push((step, executor)),
                Err(e) => {
                    if let Err(e) = self.settle(&step, Settlement::failed(e)).await {
                        if fail_fast {
                            return Err(e);
                        }
                        fatal.get_or_insert(e);
                    }
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.workflow.config.max_concurrent.max(1)));
        let mut set = JoinSet::new();
        let mut in_flight: HashMap<String, Step> = HashMap::new();

        for (step, executor) in dispatch {
            info!("Starting step: {}", step.id);
            self.plan.mark_running(&step.id);
            in_flight.insert(step.id.clone(), step.clone());

            let ctx = self.context_for(&step);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();

            set.spawn(async move {
                // held until the step finishes
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = execute_with_retry(executor.as_ref(), &step, ctx, &cancel).await;
                (step.id, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (step_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Step task ended abnormally: {}", e);
                    continue;
                }
            };

            let Some(step) = in_flight.remove(&step_id) else {
                continue;
            };

            let settlement = Settlement::from_outcome(&step.id, outcome);
            if let Err(e) = self.settle(&step, settlement).await {
                if fail_fast {
                    self.settle_finished(&mut set, &mut in_flight).await;
                    warn!("Cancelling {} in-flight step(s) after failure of '{}'", set.len(), step.id);
                    self.cancel.cancel();
                    set.shutdown().await;
                    return Err(e);
                }
                fatal.get_or_insert(e);
            }
        }

        // tasks that panicked never reported back
        let mut crashed: Vec<Step> = in_flight.into_values().collect();
        crashed.sort_by(|a, b| a.id.cmp(&b.id));
        for step in crashed {
            let error = step_error(&step.id, 1, ExecutorError::failed("executor task panicked"));
            if let Err(e) = self.settle(&step, Settlement::failed(error)).await {
                if fail_fast {
                    return Err(e);
                }
                fatal.get_or_insert(e);
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records siblings that already finished but were not joined yet.
    async fn settle_finished(
        &mut self,
        set: &mut JoinSet<(String, StepOutcome)>,
        in_flight: &mut HashMap<String, Step>,
    ) {
        while let Some(joined) = set.try_join_next() {
            let Ok((step_id, outcome)) = joined else {
                continue;
            };
            let Some(step) = in_flight.remove(&step_id) else {
                continue;
            };

            let settlement = Settlement::from_outcome(&step.id, outcome);
            if let Err(e) = self.settle(&step, settlement).await {
                debug!("Sibling '{}' also failed: {}", step.id, e);
            }
        }
    }

    async fn run_sequential(&mut self, step: Step) -> Result<(), EngineError> {
        let settlement = match self.lookup(&step) {
            Ok(executor) => {
                info!("Starting step: {}", step.id);
                self.plan.mark_running(&step.id);
                let ctx = self.context_for(&step);
                let outcome = execute_with_retry(executor.as_ref(), &step, ctx, &self.cancel).await;
                Settlement::from_outcome(&step.id, outcome)
            }
            Err(e) => Settlement::failed(e),
        };

        self.settle(&step, settlement).await
    }

    /// Records a finished step and checkpoints it.
    ///
    /// Returns the error if the failure is fatal for the workflow.
    async fn settle(&mut self, step: &Step, settlement: Settlement) -> Result<(), EngineError> {
        let Settlement {
            result,
            attempts,
            started,
            duration,
        } = settlement;
        let duration_ms = duration.as_millis() as u64;

        if let Some(started) = started {
            self.timeline.add_event_at(&step.id, EventType::Started, started);
        }

        let outcome = match result {
            Ok(output) => {
                info!("Step '{}' completed successfully", step.id);
                self.plan.mark_completed(&step.id);
                self.timeline.add_event(&step.id, EventType::Completed);
                self.state
                    .mark_completed(StepRecord::success(&step.id, output, attempts, duration_ms));
                Ok(())
            }
            Err(e) if step.optional && !always_fatal(&e) => {
                warn!("Optional step '{}' failed, continuing: {}", step.id, e);
                self.plan.mark_completed(&step.id);
                self.timeline.add_event(&step.id, EventType::Skipped);
                self.state
                    .mark_completed(StepRecord::failure(&step.id, e.to_string(), attempts, duration_ms));
                Ok(())
            }
            Err(e) => {
                error!("Step '{}' failed: {}", step.id, e);
                self.plan.mark_failed(&step.id);
                self.timeline.add_event(&step.id, EventType::Failed);
                self.state
                    .mark_step_failed(StepRecord::failure(&step.id, e.to_string(), attempts, duration_ms));
                Err(e)
            }
        };

        self.persist().await;
        outcome
    }

    fn lookup(&self, step: &Step) -> Result<Arc<dyn Executor>, EngineError> {
        self.engine
            .registry
            .get(&step.executor)
            .ok_or_else(|| EngineError::AgentNotFound {
                step_id: step.id.clone(),
                executor: step.executor.clone(),
            })
    }

    fn context_for(&self, step: &Step) -> StepContext {
        let mut ctx = StepContext::new(
            &self.state.execution_id,
            &self.workflow.id,
            Arc::clone(&self.input),
            self.engine.resources.clone(),
        );

        ctx.dependencies = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                let output = self.state.step_results.get(dep)?.output.clone()?;
                Some((dep.clone(), output))
            })
            .collect();

        ctx
    }

    fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    async fn persist(&self) {
        self.engine
            .checkpointer
            .persist(&self.state, self.workflow.config.save_state)
            .await;
    }

    fn into_report(self) -> ExecutionReport {
        ExecutionReport {
            results: ordered_results(&self.plan, &self.state),
            execution_id: self.state.execution_id,
            workflow_id: self.workflow.id,
            status: self.state.status,
            timeline: self.timeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<Value, ExecutorError> {
            Ok(json!({"step": step.id, "deps": ctx.dependencies.keys().collect::<Vec<_>>()}))
        }
    }

    struct Fail;

    #[async_trait]
    impl Executor for Fail {
        async fn execute(&self, _step: &Step, _ctx: &StepContext) -> Result<Value, ExecutorError> {
            Err(ExecutorError::failed("nope"))
        }
    }

    fn engine() -> Engine {
        let engine = Engine::new();
        engine.register_executor("echo", Arc::new(Echo));
        engine.register_executor("fail", Arc::new(Fail));
        engine
    }

    fn diamond() -> Workflow {
        Workflow::from_steps(
            "diamond",
            vec![
                Step::new("top", "echo"),
                Step::new("left", "echo").depends_on("top").parallel(),
                Step::new("right", "echo").depends_on("top").parallel(),
                Step::new("bottom", "echo").depends_on("left").depends_on("right"),
            ],
        )
    }

    #[test]
    fn test_register_sets_ready() {
        let engine = engine();
        engine.register_workflow(diamond()).unwrap();

        assert_eq!(engine.workflow_status("diamond"), Some(WorkflowStatus::Ready));
        assert_eq!(engine.workflow_status("missing"), None);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let engine = engine();
        let invalid = Workflow::from_steps("bad", vec![Step::new("a", "echo").depends_on("ghost")]);

        assert!(matches!(
            engine.register_workflow(invalid),
            Err(EngineError::Validation(_))
        ));
        assert!(engine.workflow("bad").is_none());
    }

    #[tokio::test]
    async fn test_execute_unknown_workflow() {
        let result = engine().execute("nope", Value::Null).await;
        assert!(matches!(result, Err(EngineError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_diamond_completes_in_level_order() {
        let engine = engine();
        let report = engine.run_workflow(diamond(), Value::Null).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.step_ids(), vec!["top", "left", "right", "bottom"]);
        assert_eq!(report.output("bottom").unwrap()["deps"], json!(["left", "right"]));
        assert_eq!(engine.workflow_status("diamond"), Some(WorkflowStatus::Completed));
        assert_eq!(report.timeline.spans().len(), 4);
    }

    #[tokio::test]
    async fn test_workflow_can_run_again_after_completion() {
        let engine = engine();
        let first = engine.run_workflow(diamond(), Value::Null).await.unwrap();
        let second = engine.execute("diamond", Value::Null).await.unwrap();

        assert_ne!(first.execution_id, second.execution_id);
        assert_eq!(engine.list_executions("diamond", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_marks_workflow_failed() {
        let engine = engine();
        let workflow = Workflow::from_steps(
            "broken",
            vec![Step::new("a", "echo"), Step::new("b", "fail").depends_on("a")],
        );

        let err = engine
            .run_workflow(workflow, Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err.step_id(), Some("b"));
        assert_eq!(engine.workflow_status("broken"), Some(WorkflowStatus::Failed));

        let executions = engine.list_executions("broken", 1).await.unwrap();
        assert_eq!(executions[0].status, WorkflowStatus::Failed);
        assert!(executions[0].error.as_deref().unwrap().contains("nope"));
        assert!(executions[0].completed_steps.contains("a"));
    }

    #[tokio::test]
    async fn test_resume_completed_returns_recorded_results() {
        let engine = engine();
        let report = engine.run_workflow(diamond(), Value::Null).await.unwrap();

        let resumed = engine.resume(&report.execution_id).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.results, report.results);
        assert!(resumed.timeline.events().is_empty());
    }

    #[tokio::test]
    async fn test_execution_id_cannot_be_reused() {
        let engine = engine();
        engine.register_workflow(diamond()).unwrap();
        engine
            .register_workflow(Workflow::from_steps("other", vec![Step::new("only", "echo")]))
            .unwrap();

        engine.execute_with_id("diamond", "same", Value::Null).await.unwrap();
        let err = engine.execute_with_id("other", "same", Value::Null).await.unwrap_err();

        assert!(matches!(err, EngineError::ExecutionExists(ref id) if id == "same"));
        assert_eq!(engine.workflow_status("other"), Some(WorkflowStatus::Ready));
        assert!(engine.active_executions().is_empty());

        let kept = engine.list_executions("diamond", 10).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].execution_id, "same");
        assert_eq!(engine.get_execution_status("same").await.unwrap().total_steps, 4);
        assert!(engine.list_executions("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_unknown_execution() {
        assert!(matches!(
            engine().pause("ghost"),
            Err(EngineError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn test_transition_ignores_invalid_change() {
        let mut workflow = diamond();
        transition(&mut workflow, WorkflowStatus::Completed);
        assert_eq!(workflow.status, WorkflowStatus::Draft);

        transition(&mut workflow, WorkflowStatus::Ready);
        transition(&mut workflow, WorkflowStatus::Running);
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }
}
