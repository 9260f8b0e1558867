use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crawlgrid::browser::HttpDriver;
use crawlgrid::config::AppConfig;
use crawlgrid::executor::{CrawlExecutor, ExecutionEvent};
use crawlgrid::logging::init_logging;
use crawlgrid::recovery::IncidentStatus;
use crawlgrid::storage::Storage;
use crawlgrid::workflow::{NodeRegistry, Workflow};

#[derive(Parser)]
#[command(name = "crawlgrid", version, about = "Programmable multi-phase web crawler")]
struct Cli {
    /// Configuration file; defaults to the platform config directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow file without running it
    Validate {
        /// Workflow definition (YAML or JSON)
        workflow: PathBuf,
    },
    /// Run a workflow to completion
    Run {
        workflow: PathBuf,
        /// Scaled-down dry run: caps URLs per phase and skips item storage
        #[arg(long)]
        health_check: bool,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show stored statistics for one execution
    Stats { execution_id: String },
    /// List or update recovery incidents
    Incidents {
        /// Include closed (in-progress, resolved, ignored) incidents
        #[arg(long)]
        all: bool,
        /// Mark an incident as being worked on
        #[arg(long, value_name = "INCIDENT_ID")]
        start: Option<String>,
        /// Mark an incident resolved
        #[arg(long, value_name = "INCIDENT_ID")]
        resolve: Option<String>,
        /// Ignore an incident as noise
        #[arg(long, value_name = "INCIDENT_ID")]
        ignore: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path).await?,
        None => AppConfig::load().await?,
    };
    init_logging(&config.logging)?;
    info!("CrawlGrid v{}", crawlgrid::VERSION);

    match cli.command {
        Command::Validate { workflow } => validate(&workflow).await,
        Command::Run { workflow, health_check, workers } => {
            run(config, &workflow, health_check, workers).await
        }
        Command::Stats { execution_id } => stats(config, &execution_id).await,
        Command::Incidents { all, start, resolve, ignore } => {
            incidents(config, all, start, resolve, ignore).await
        }
    }
}

async fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let workflow = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Workflow::from_json(&content)?,
        _ => Workflow::from_yaml(&content)?,
    };
    Ok(workflow)
}

async fn validate(path: &Path) -> Result<()> {
    let workflow = load_workflow(path).await?;
    let registry = NodeRegistry::with_builtin_handlers();
    registry.validate_workflow(&workflow)?;
    println!(
        "OK: workflow '{}' ({} phases, {} start URLs)",
        workflow.id,
        workflow.phases.len(),
        workflow.start_urls.len()
    );
    Ok(())
}

async fn run(
    mut config: AppConfig,
    path: &Path,
    health_check: bool,
    workers: Option<usize>,
) -> Result<()> {
    if health_check {
        config.executor.max_urls_per_phase = Some(10);
        config.executor.max_depth = Some(2);
        config.executor.skip_data_storage = true;
        info!("Health-check mode: capped URLs, no item storage");
    }
    if let Some(workers) = workers {
        config.executor.workers = workers;
    }

    let workflow = load_workflow(path).await?;
    let storage = Storage::open(&config.database).await?;
    let driver = Arc::new(HttpDriver::new(
        Duration::from_secs(config.browser.navigation_timeout_seconds),
        Duration::from_millis(config.browser.per_domain_delay_ms),
    ));
    let executor = CrawlExecutor::new(&config, storage, driver).await?;

    let mut events = executor.events().subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::PhaseStarted { phase_id, .. } => {
                    println!("phase {} started", phase_id);
                }
                ExecutionEvent::PhaseCompleted { phase_id, tasks_processed, .. } => {
                    println!("phase {} done ({} tasks)", phase_id, tasks_processed);
                }
                ExecutionEvent::IncidentOpened { incident_id, .. } => {
                    println!("incident opened: {}", incident_id);
                }
                ExecutionEvent::ExecutionFinished { .. } => break,
                _ => {}
            }
        }
    });

    let execution = executor.run(&workflow).await?;
    let _ = progress.await;

    println!();
    println!("execution {}", execution.id);
    println!("  status:          {}", execution.status);
    println!("  urls processed:  {}", execution.urls_processed);
    println!("  urls discovered: {}", execution.urls_discovered);
    println!("  items extracted: {}", execution.items_extracted);
    println!("  errors:          {}", execution.errors);
    Ok(())
}

async fn stats(config: AppConfig, execution_id: &str) -> Result<()> {
    let storage = Storage::open(&config.database).await?;
    let execution = storage.executions().get(execution_id).await?;

    println!("execution {} ({})", execution.id, execution.workflow_id);
    println!("  status:          {}", execution.status);
    println!("  started:         {}", execution.started_at.to_rfc3339());
    if let Some(completed) = execution.completed_at {
        println!("  completed:       {}", completed.to_rfc3339());
    }
    println!("  urls processed:  {}", execution.urls_processed);
    println!("  urls discovered: {}", execution.urls_discovered);
    println!("  items extracted: {}", execution.items_extracted);
    println!("  errors:          {}", execution.errors);

    let mut phases: Vec<_> = execution.phase_stats.iter().collect();
    phases.sort_by(|a, b| a.0.cmp(b.0));
    for (phase_id, stats) in phases {
        println!(
            "  phase {}: {} processed, {} errors, {}ms",
            phase_id, stats.processed, stats.errors, stats.duration_ms
        );
    }
    Ok(())
}

async fn incidents(
    config: AppConfig,
    all: bool,
    start: Option<String>,
    resolve: Option<String>,
    ignore: Option<String>,
) -> Result<()> {
    let storage = Storage::open(&config.database).await?;
    let repo = storage.recovery();

    if let Some(id) = start {
        repo.update_incident_status(&id, IncidentStatus::InProgress).await?;
        println!("incident {} in progress", id);
        return Ok(());
    }
    if let Some(id) = resolve {
        repo.update_incident_status(&id, IncidentStatus::Resolved).await?;
        println!("incident {} resolved", id);
        return Ok(());
    }
    if let Some(id) = ignore {
        repo.update_incident_status(&id, IncidentStatus::Ignored).await?;
        println!("incident {} ignored", id);
        return Ok(());
    }

    let filter = if all { None } else { Some(IncidentStatus::Open) };
    let incidents = repo.list_incidents(filter).await?;
    if incidents.is_empty() {
        println!("no incidents");
        return Ok(());
    }
    for incident in incidents {
        println!(
            "{} [{}] task {} - {} ({} attempts)",
            incident.id,
            incident.status,
            incident.task_id,
            incident.error_pattern,
            incident.total_attempts
        );
    }
    Ok(())
}
