//! taskmill CLI - run task graphs with retries, breakers and dependencies.

mod runner;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use runner::CommandRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskmill_core::{Execution, ExecutionFilter, ExecutionId, ExecutionStatus};
use taskmill_execution::{EngineConfig, ExecutionEngine, HookStage, TaskGraph};
use taskmill_resilience::CircuitBreakerRegistry;
use taskmill_storage::{JsonStore, TaskStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmill")]
#[command(about = "Fault-tolerant task scheduler", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding execution snapshots
    #[arg(long, global = true, default_value = ".taskmill")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task graph until every execution finishes
    Run {
        /// Graph file (JSON)
        graph: PathBuf,
        /// Working directory for commands without a `cwd` parameter
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Resume unfinished executions from the state directory
    Resume {
        /// Working directory for commands without a `cwd` parameter
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Check a task graph for cycles and print its execution order
    Validate {
        /// Graph file (JSON)
        graph: PathBuf,
    },
    /// List recorded executions
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one execution
    Show {
        /// Execution ID
        id: String,
    },
    /// Show totals by status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { graph, workdir } => {
            let graph = read_graph(&graph)?;
            let engine = build_engine(cli.config.as_deref(), &cli.state_dir, workdir).await?;
            let mut events = engine.subscribe();

            let ids = engine.schedule_graph(graph).await?;
            info!(count = ids.len(), "scheduled graph");

            drive(&engine, &mut events).await?;
            report(&engine).await
        }
        Commands::Resume { workdir } => {
            let engine = build_engine(cli.config.as_deref(), &cli.state_dir, workdir).await?;
            let mut events = engine.subscribe();

            let restored = engine.restore_from_store().await?;
            if restored == 0 {
                println!("Nothing to resume.");
                return Ok(());
            }

            drive(&engine, &mut events).await?;
            report(&engine).await
        }
        Commands::Validate { graph } => {
            let graph = read_graph(&graph)?;
            match graph.dependency_graph().topological_order() {
                Ok(order) => {
                    println!("Execution order:");
                    for (i, task_id) in order.iter().enumerate() {
                        println!("  {}. {}", i + 1, task_id);
                    }
                    Ok(())
                }
                Err(cycle) => bail!("{}", cycle),
            }
        }
        Commands::List { status } => {
            let store = JsonStore::new(&cli.state_dir).await?;
            let filter = ExecutionFilter {
                status: status.as_deref().map(parse_status).transpose()?.map(|s| vec![s]),
                ..Default::default()
            };

            let executions: Vec<Execution> = store
                .load_all()
                .await?
                .into_iter()
                .filter(|e| filter.matches(e))
                .collect();

            println!("Executions ({}):", executions.len());
            for execution in &executions {
                print_row(execution);
            }
            Ok(())
        }
        Commands::Show { id } => {
            let store = JsonStore::new(&cli.state_dir).await?;
            let id: ExecutionId = id
                .parse()
                .map_err(|e| anyhow!("invalid execution id '{}': {}", id, e))?;
            let execution = store
                .load(id)
                .await?
                .ok_or_else(|| anyhow!("execution {} not found", id))?;

            println!("Execution: {}", execution.execution_id);
            println!("  Task: {}", execution.task_id);
            println!("  Workflow: {}", execution.workflow_type);
            println!("  Priority: {:?}", execution.priority);
            println!("  Status: {}", execution.status);
            println!(
                "  Retries: {}/{} ({:?})",
                execution.retry_count, execution.max_retries, execution.retry_strategy
            );
            println!("  Breaker: {}", execution.breaker);
            if let Some(target) = &execution.target {
                println!("  Target: {}", target);
            }
            if let Some(error) = &execution.error {
                println!("  Error: {}", error);
            }
            if let Some(result) = &execution.result {
                println!("  Result: {}", result);
            }
            println!("  History:");
            for change in &execution.status_history {
                println!("    {} {}", change.timestamp.to_rfc3339(), change.status);
            }
            Ok(())
        }
        Commands::Status => {
            let store = JsonStore::new(&cli.state_dir).await?;
            let executions = store.load_all().await?;

            println!("Executions: {}", executions.len());
            for status in ExecutionStatus::ALL {
                let count = executions.iter().filter(|e| e.status == status).count();
                if count > 0 {
                    println!("  {}: {}", status, count);
                }
            }
            Ok(())
        }
    }
}

fn read_graph(path: &Path) -> Result<TaskGraph> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid graph in {}", path.display()))
}

async fn build_engine(
    config: Option<&Path>,
    state_dir: &Path,
    workdir: Option<PathBuf>,
) -> Result<Arc<ExecutionEngine>> {
    let config = match config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let store = JsonStore::new(state_dir).await?;

    let engine = ExecutionEngine::new(
        config,
        Arc::new(CommandRunner::new(workdir)),
        Arc::new(CircuitBreakerRegistry::new()),
    )?
    .with_store(Arc::new(store))
    .with_hook(HookStage::Orphaned, |ctx| {
        warn!(
            execution_id = %ctx.execution.execution_id,
            task_id = %ctx.execution.task_id,
            "discarded late result"
        );
        Ok(())
    });

    Ok(Arc::new(engine))
}

/// Run the control loop until every execution is final or Ctrl-C.
async fn drive(
    engine: &Arc<ExecutionEngine>,
    events: &mut tokio::sync::broadcast::Receiver<taskmill_core::StatusEvent>,
) -> Result<()> {
    let handle = engine.start();

    while !engine.is_settled().await {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping scheduler");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!(
                    "{} {:<20} {}",
                    event.timestamp.format("%H:%M:%S%.3f"),
                    event.task_id,
                    event.status
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed status events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown();
    handle.await?;
    Ok(())
}

async fn report(engine: &ExecutionEngine) -> Result<()> {
    let executions = engine.list_executions(&ExecutionFilter::default()).await;

    println!();
    println!("Executions ({}):", executions.len());
    for execution in &executions {
        print_row(execution);
    }

    let stats = engine.get_stats().await;
    let completed = stats
        .by_status
        .get(&ExecutionStatus::Completed)
        .copied()
        .unwrap_or(0);
    println!("Completed {}/{}", completed, stats.total);

    for (name, metrics) in engine.breaker_metrics() {
        println!(
            "Breaker {}: {:?} ({} failures)",
            name, metrics.state, metrics.failure_count
        );
    }

    if completed < stats.total {
        bail!("{} executions did not complete", stats.total - completed);
    }
    Ok(())
}

fn print_row(execution: &Execution) {
    print!(
        "  {} {:<20} {:<10} retries={}",
        execution.execution_id, execution.task_id, execution.status, execution.retry_count
    );
    match &execution.error {
        Some(error) => println!(" error={}", error),
        None => println!(),
    }
}

fn parse_status(input: &str) -> Result<ExecutionStatus> {
    ExecutionStatus::ALL
        .into_iter()
        .find(|s| s.to_string().eq_ignore_ascii_case(input))
        .ok_or_else(|| anyhow!("unknown status '{}'", input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_ignores_case() {
        assert_eq!(parse_status("failed").unwrap(), ExecutionStatus::Failed);
        assert_eq!(parse_status("RETRYING").unwrap(), ExecutionStatus::Retrying);
        assert!(parse_status("done").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "taskmill",
            "--state-dir",
            "/tmp/state",
            "run",
            "graph.json",
        ])
        .unwrap();

        assert_eq!(cli.state_dir, PathBuf::from("/tmp/state"));
        assert!(matches!(cli.command, Commands::Run { ref graph, .. } if graph == Path::new("graph.json")));
    }
}
