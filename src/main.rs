//! Stepweaver CLI Entry Point
//!
//! Drives the engine end to end with the built-in `shell` and `echo`
//! executors. Checkpoints are written under the state directory, so a
//! failed or interrupted run can be resumed by a later invocation.
//!
//! # Usage
//!
//! ```bash
//! # Check a definition and show its dependency levels
//! stepweaver validate site.yaml
//!
//! # Execute a workflow (Ctrl-C pauses after the running batch)
//! stepweaver run site.yaml --input '{"lang": "en"}'
//!
//! # Continue a paused or failed execution
//! stepweaver resume 5f0c...e1 --workflow site.yaml
//!
//! # Inspect checkpoints
//! stepweaver status 5f0c...e1
//! stepweaver list site_build --limit 5
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{info, warn};
use serde_json::Value;
use uuid::Uuid;

use stepweaver::execution::{EchoExecutor, Engine, ExecutionReport, ShellExecutor};
use stepweaver::resources::{BudgetPeriod, BudgetTracker, Optimizer, ResultCache, DEFAULT_CACHE_CAPACITY};
use stepweaver::store::FileStateStore;
use stepweaver::workflow::{compute_levels, load_workflow, StepRecord, WorkflowStatus};
use stepweaver::{APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "stepweaver")]
#[command(about = "Checkpointing workflow runner")]
#[command(version)]
struct Cli {
    /// Directory holding execution checkpoints
    #[arg(long, global = true, env = "STEPWEAVER_STATE_DIR", default_value = ".stepweaver")]
    state_dir: PathBuf,

    /// Budget limit shared by all steps (unlimited if omitted)
    #[arg(long, global = true)]
    budget_limit: Option<u64>,

    /// Budget accounting period: hourly, daily or monthly
    #[arg(long, global = true, default_value = "daily")]
    budget_period: BudgetPeriod,

    /// Entries kept in the optimizer cache
    #[arg(long, global = true, default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache_capacity: usize,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file and print its dependency levels
    Validate {
        /// Path to the workflow YAML or JSON file
        file: PathBuf,
    },

    /// Execute a workflow
    Run {
        /// Path to the workflow YAML or JSON file
        file: PathBuf,

        /// JSON input handed to every step
        #[arg(long)]
        input: Option<String>,

        /// Working directory for shell steps
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Continue an execution from its last checkpoint
    Resume {
        /// Execution ID printed by `run`
        execution_id: String,

        /// Workflow file the execution was started from
        #[arg(long)]
        workflow: PathBuf,

        /// Working directory for shell steps
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Show the progress of an execution
    Status {
        execution_id: String,
    },

    /// List recent executions of a workflow
    List {
        workflow_id: String,

        /// Maximum number of executions shown
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Builds an engine from the global options.
fn build_engine(cli: &Cli, working_dir: Option<&Path>) -> Engine {
    let store = FileStateStore::new(cli.state_dir.join("executions"));

    let budget = match cli.budget_limit {
        Some(limit) => BudgetTracker::new(limit, cli.budget_period),
        None => BudgetTracker::unlimited(),
    };

    let cache = Arc::new(ResultCache::new(cli.cache_capacity));

    let engine = Engine::new()
        .with_state_store(Arc::new(store))
        .with_budget(Arc::new(budget))
        .with_optimizer(Arc::new(Optimizer::new(cache)));

    let shell = match working_dir {
        Some(dir) => ShellExecutor::new().with_working_dir(dir),
        None => ShellExecutor::new(),
    };
    engine.register_executor("shell", Arc::new(shell));
    engine.register_executor("echo", Arc::new(EchoExecutor));

    engine
}

fn validate(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = load_workflow(file)?;

    println!(
        "{} {} v{} ({} steps)",
        "✓".green().bold(),
        workflow.id.bold(),
        workflow.version,
        workflow.len()
    );

    for (level, steps) in compute_levels(&workflow.steps).iter().enumerate() {
        println!("  level {}: {}", level, steps.join(", "));
    }

    Ok(())
}

/// Executes (or resumes) on a shared engine, pausing on Ctrl-C.
async fn run_with_pause(
    engine: Arc<Engine>,
    execution_id: String,
    work: impl std::future::Future<Output = Result<ExecutionReport, stepweaver::EngineError>>,
) -> Result<ExecutionReport, stepweaver::EngineError> {
    let pauser = Arc::clone(&engine);
    let id = execution_id.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; pausing after the running steps finish");
            if let Err(e) = pauser.pause(&id) {
                warn!("Could not pause: {}", e);
            }
        }
    });

    let result = work.await;
    watcher.abort();
    result
}

fn print_report(report: &ExecutionReport, engine: &Engine) {
    println!();
    for record in &report.results {
        print_record(record);
    }

    println!("{}", report.timeline.gantt_chart());

    let budget = engine.resources().budget.snapshot();
    if budget.limit != u64::MAX {
        println!("Budget: {}/{} used ({:?})", budget.used, budget.limit, budget.period);
    }

    let savings = engine.resources().optimizer.savings();
    if savings.runs > 0 || savings.cache_hits > 0 {
        println!(
            "Optimizer: {} runs, {} cache hits, ~{} tokens saved",
            savings.runs, savings.cache_hits, savings.tokens_saved
        );
    }

    match report.status {
        WorkflowStatus::Paused => println!(
            "{} Execution {} paused; continue with `stepweaver resume {} --workflow <file>`",
            "⏸".yellow(),
            report.execution_id,
            report.execution_id
        ),
        status => println!(
            "{} Execution {} {}",
            "✓".green().bold(),
            report.execution_id,
            status.to_string().green()
        ),
    }
}

fn print_record(record: &StepRecord) {
    let marker = if record.succeeded() {
        "✓".green()
    } else {
        "~".yellow()
    };

    print!(
        "  {} {:20} {:>6} ms  attempts: {}",
        marker, record.step_id, record.duration_ms, record.attempts
    );
    match &record.error {
        Some(error) => println!("  {}", error.yellow()),
        None => println!(),
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Commands::Validate { file } => validate(file)?,

        Commands::Run {
            file,
            input,
            working_dir,
        } => {
            let context: Value = match input {
                Some(text) => serde_json::from_str(text).map_err(|e| format!("Invalid --input JSON: {}", e))?,
                None => Value::Null,
            };

            let workflow = load_workflow(file)?;
            let workflow_id = workflow.id.clone();

            let engine = Arc::new(build_engine(&cli, working_dir.as_deref()));
            engine.register_workflow(workflow)?;

            let execution_id = Uuid::new_v4().to_string();
            info!("Execution ID: {}", execution_id);

            let work = engine.execute_with_id(&workflow_id, execution_id.clone(), context);
            let report = run_with_pause(Arc::clone(&engine), execution_id, work).await?;
            print_report(&report, &engine);
        }

        Commands::Resume {
            execution_id,
            workflow,
            working_dir,
        } => {
            let workflow = load_workflow(workflow)?;
            let engine = Arc::new(build_engine(&cli, working_dir.as_deref()));
            engine.register_workflow(workflow)?;

            let work = engine.resume(execution_id);
            let report = run_with_pause(Arc::clone(&engine), execution_id.clone(), work).await?;
            print_report(&report, &engine);
        }

        Commands::Status { execution_id } => {
            let engine = build_engine(&cli, None);
            let status = engine.get_execution_status(execution_id).await?;

            let label = match status.status {
                WorkflowStatus::Completed => status.status.to_string().green(),
                WorkflowStatus::Failed => status.status.to_string().red(),
                _ => status.status.to_string().yellow(),
            };
            println!(
                "{}: {} ({}/{} steps)",
                execution_id, label, status.completed_steps, status.total_steps
            );
        }

        Commands::List { workflow_id, limit } => {
            let engine = build_engine(&cli, None);
            let executions = engine.list_executions(workflow_id, *limit).await?;

            if executions.is_empty() {
                println!("No executions of '{}'", workflow_id);
            }

            for state in executions {
                println!(
                    "{}  {:9}  {}/{}  {}",
                    state.execution_id,
                    state.status.to_string(),
                    state.completed_steps.len(),
                    state.total_steps,
                    state.started_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(error) = state.error {
                    println!("    {}", error.red());
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    info!("{} v{}", APP_NAME, VERSION);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
