use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use swarmops::config::SwarmConfig;
use swarmops::gateway::HttpGateway;
use swarmops::orchestrator::Orchestrator;
use swarmops::{activity, progress, server, watcher};

#[derive(Parser)]
#[command(name = "swarmops")]
#[command(version, about = "Swarm pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Data root for orchestrator state
    #[arg(long, global = true, env = "SWARMOPS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator: webhook server plus watcher and watchdog pollers
    Serve,
    /// Start (or resume) a pipeline run for a project
    Start { project: String },
    /// Parse a progress document and report the task graph
    Validate { progress_file: PathBuf },
    /// Show the open escalation queue
    Escalations,
    /// Show a project's phase, status, and active run
    Status { project: String },
    /// Cancel a project's active run
    Cancel {
        project: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

/// Console logging always; a rolling JSON log file under the data root for
/// long-lived `serve` sessions. The returned guard must stay alive so the
/// non-blocking writer flushes on shutdown.
fn init_tracing(
    verbose: bool,
    log_dir: Option<PathBuf>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let default = if verbose { "swarmops=debug" } else { "swarmops=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let console = tracing_subscriber::fmt::layer();

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "swarmops.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = SwarmConfig::load(cli.data_dir.clone())?;
    let log_dir = matches!(cli.command, Commands::Serve).then(|| config.data_root.join("logs"));
    let _log_guard = init_tracing(cli.verbose, log_dir)?;

    match &cli.command {
        Commands::Validate { progress_file } => {
            return cmd_validate(progress_file);
        }
        _ => {}
    }

    let gateway = Arc::new(HttpGateway::new(
        config.gateway_url.clone(),
        config.gateway_token.clone(),
    ));
    let orchestrator = Orchestrator::new(config, gateway)?;

    match cli.command {
        Commands::Serve => {
            let resumed = orchestrator.resume_on_start().await?;
            if resumed > 0 {
                println!("Resumed {resumed} in-flight run(s)");
            }
            let _pollers = watcher::spawn_pollers(orchestrator.clone());
            server::serve(orchestrator).await?;
        }
        Commands::Start { project } => {
            let run = orchestrator.start_project(&project).await?;
            println!(
                "Run {} active for {} (phase {})",
                run.run_id, project, run.current_phase_number
            );
        }
        Commands::Escalations => cmd_escalations(&orchestrator).await?,
        Commands::Status { project } => cmd_status(&orchestrator, &project)?,
        Commands::Cancel { project, reason } => {
            match orchestrator.runs.active_run_for(&project)? {
                Some(run) => {
                    orchestrator.cancel_run(&run.run_id, &reason).await?;
                    println!("Cancelled run {}", run.run_id);
                }
                None => println!("No active run for {project}"),
            }
        }
        Commands::Validate { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn cmd_validate(progress_file: &PathBuf) -> Result<()> {
    let graph = progress::parse_file(progress_file)
        .with_context(|| format!("{} failed to parse", progress_file.display()))?;
    println!(
        "{} tasks across {} phase(s)",
        graph.len(),
        graph.phases().len()
    );
    for phase in graph.phases() {
        let done = phase
            .task_ids
            .iter()
            .filter(|id| graph.get(id).is_some_and(|t| t.done))
            .count();
        println!(
            "  Phase {} {}: {}/{} done",
            phase.number,
            phase.name,
            done,
            phase.task_ids.len()
        );
    }
    let ready: Vec<&str> = graph.ready_tasks().iter().map(|t| t.id.as_str()).collect();
    println!("Ready: {}", if ready.is_empty() { "-".to_string() } else { ready.join(", ") });
    Ok(())
}

async fn cmd_escalations(orchestrator: &Arc<Orchestrator>) -> Result<()> {
    let open = {
        let mut escalations = orchestrator.escalations_handle().lock().await;
        escalations.list_open()?
    };
    if open.is_empty() {
        println!("No open escalations");
        return Ok(());
    }
    for esc in open {
        println!(
            "[{}] {} run={} phase={} task={} — {}",
            esc.severity.as_str(),
            esc.id,
            esc.run_id,
            esc.phase_number,
            esc.task_id.as_deref().unwrap_or("-"),
            esc.message
        );
    }
    Ok(())
}

fn cmd_status(orchestrator: &Arc<Orchestrator>, project: &str) -> Result<()> {
    let project_dir = orchestrator.project_dir(project);
    let state = activity::load_state(&project_dir)?;
    println!("Project: {project}");
    println!("  Phase: {}", state.phase.as_str());
    println!(
        "  Status: {}",
        if state.status.is_empty() { "-" } else { state.status.as_str() }
    );
    match orchestrator.runs.active_run_for(project)? {
        Some(run) => println!(
            "  Active run: {} ({}, phase {})",
            run.run_id,
            run.status.as_str(),
            run.current_phase_number
        ),
        None => println!("  Active run: none"),
    }
    Ok(())
}
