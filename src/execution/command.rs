//! Built-in Executors
//!
//! Two reference executors used by the command-line runner:
//! - `shell`: runs `params.command` with bash
//! - `echo`: returns `params` unchanged
//!
//! Both charge `params.cost` against the shared budget before doing any
//! work.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, error};
use serde_json::Value;
use tokio::process::Command;

use super::executor::{Executor, ExecutorError, StepContext};
use crate::workflow::Step;

/// Charges `params.cost`, if present, against the budget.
fn charge_cost(step: &Step, ctx: &StepContext) -> Result<(), ExecutorError> {
    if let Some(cost) = step.params.get("cost").and_then(Value::as_u64) {
        ctx.track_usage(cost)?;
        debug!("Step '{}' charged {} to the budget", step.id, cost);
    }
    Ok(())
}

/// Returns the step parameters as its output.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<Value, ExecutorError> {
        charge_cost(step, ctx)?;
        Ok(step.params.clone())
    }
}

/// Runs a bash command.
///
/// # Parameters
///
/// - `command` (required): script text, run under `set -e`
/// - `optimize`: pass stdout through the shared optimizer
/// - `cost`: budget units charged before running
///
/// # Placeholder Substitution
///
/// - `{execution_id}`, `{workflow_id}`, `{step_id}`, `{attempt}`
/// - `{dep:<step>}`: output of a dependency (strings verbatim, other values as JSON)
///
/// The execution input is exported as JSON in `STEPWEAVER_INPUT`.
///
/// Stdout that parses as JSON becomes the output value; otherwise the
/// trimmed text is returned as a string.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory for commands.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Resolves command placeholders against the step context.
fn resolve_placeholders(command: &str, step: &Step, ctx: &StepContext) -> String {
    let mut resolved = command
        .replace("{execution_id}", &ctx.execution_id)
        .replace("{workflow_id}", &ctx.workflow_id)
        .replace("{step_id}", &step.id)
        .replace("{attempt}", &ctx.attempt.to_string());

    for (dep, output) in &ctx.dependencies {
        let text = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        resolved = resolved.replace(&format!("{{dep:{}}}", dep), &text);
    }

    resolved
}

/// Interprets command stdout as JSON when possible.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<Value, ExecutorError> {
        let command = step
            .params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::failed(format!("step '{}' has no 'command' parameter", step.id)))?;

        charge_cost(step, ctx)?;

        let script = format!("set -e\n{}", resolve_placeholders(command, step, ctx));

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&script)
            .env("STEPWEAVER_INPUT", ctx.input.to_string())
            .env("STEPWEAVER_EXECUTION_ID", &ctx.execution_id)
            .env("STEPWEAVER_STEP_ID", &step.id)
            .env("STEPWEAVER_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| ExecutorError::failed(format!("failed to spawn bash: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "Step '{}' failed with exit code: {:?}",
                step.id,
                output.status.code()
            );
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }

            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(ExecutorError::failed(format!(
                "command exited with {}: {}",
                code,
                stderr.trim()
            )));
        }

        if !stdout.trim().is_empty() {
            debug!("Step '{}' output:\n{}", step.id, stdout);
        }

        let wants_optimize = step.params.get("optimize").and_then(Value::as_bool).unwrap_or(false);
        if wants_optimize {
            let optimized = ctx.optimizer().optimize(&stdout);
            return Ok(Value::String(optimized.output));
        }

        Ok(parse_output(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{BudgetPeriod, BudgetTracker, SharedResources};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ctx() -> StepContext {
        StepContext::new("exec-7", "wf", Arc::new(json!({"name": "demo"})), SharedResources::default())
    }

    fn shell(command: &str) -> Step {
        Step::new("run", "shell").with_params(json!({"command": command}))
    }

    #[test]
    fn test_resolve_placeholders() {
        let mut ctx = ctx();
        ctx.attempt = 2;
        ctx.dependencies.insert("fetch".into(), json!("page.html"));
        ctx.dependencies.insert("count".into(), json!({"n": 3}));

        let resolved = resolve_placeholders(
            "{step_id}/{attempt} {dep:fetch} {dep:count} {execution_id}",
            &Step::new("render", "shell"),
            &ctx,
        );

        assert_eq!(resolved, r#"render/2 page.html {"n":3} exec-7"#);
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("{\"ok\": true}\n"), json!({"ok": true}));
        assert_eq!(parse_output("  hello world \n"), json!("hello world"));
        assert_eq!(parse_output("42"), json!(42));
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let step = Step::new("e", "echo").with_params(json!({"text": "hi"}));
        assert_eq!(EchoExecutor.execute(&step, &ctx()).await.unwrap(), json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_cost_charged_to_budget() {
        let budget = Arc::new(BudgetTracker::new(10, BudgetPeriod::Daily));
        let mut ctx = ctx();
        ctx.resources = SharedResources {
            budget: Arc::clone(&budget),
            ..SharedResources::default()
        };

        let step = Step::new("e", "echo").with_params(json!({"cost": 6}));
        EchoExecutor.execute(&step, &ctx).await.unwrap();
        assert_eq!(budget.snapshot().used, 6);

        let err = EchoExecutor.execute(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Budget(_)));
        assert_eq!(budget.snapshot().used, 6);
    }

    #[tokio::test]
    async fn test_shell_json_stdout() {
        let output = ShellExecutor::new()
            .execute(&shell(r#"echo '{"pages": 3}'"#), &ctx())
            .await
            .unwrap();
        assert_eq!(output, json!({"pages": 3}));
    }

    #[tokio::test]
    async fn test_shell_sees_input_env() {
        let output = ShellExecutor::new()
            .execute(&shell("echo \"$STEPWEAVER_INPUT\""), &ctx())
            .await
            .unwrap();
        assert_eq!(output, json!({"name": "demo"}));
    }

    #[tokio::test]
    async fn test_shell_failure_reports_exit_code() {
        let err = ShellExecutor::new()
            .execute(&shell("echo broken >&2; exit 3"), &ctx())
            .await
            .unwrap_err();

        assert_eq!(err, ExecutorError::failed("command exited with 3: broken"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_shell_set_e_stops_early() {
        let err = ShellExecutor::new()
            .execute(&shell("false\necho unreachable"), &ctx())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_shell_missing_command() {
        let err = ShellExecutor::new()
            .execute(&Step::new("run", "shell"), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no 'command'"));
    }

    #[tokio::test]
    async fn test_shell_working_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found").unwrap();

        let output = ShellExecutor::new()
            .with_working_dir(dir.path())
            .execute(&shell("cat marker.txt"), &ctx())
            .await
            .unwrap();
        assert_eq!(output, json!("found"));
    }

    #[tokio::test]
    async fn test_shell_optimize_output() {
        let step = Step::new("run", "shell").with_params(json!({
            "command": "printf 'a    b   \\n\\n\\n\\nc'",
            "optimize": true,
        }));

        let output = ShellExecutor::new().execute(&step, &ctx()).await.unwrap();
        assert_eq!(output, json!("a b\n\nc"));
    }
}
