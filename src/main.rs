use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman::events::EventBus;
use foreman::orchestrator::{ProjectContext, architect, coder, planner};
use foreman::server::{ServerConfig, build_engine_registry, start_server};
use foreman::store::workspace::Workspace;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Control plane for AI-assisted development with human approval authority")]
struct Cli {
    #[arg(long, global = true, default_value = ".foreman/data")]
    data_dir: PathBuf,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server and event channel
    Serve {
        #[arg(short, long, default_value_t = 4180)]
        port: u16,
    },
    /// Project administration
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Run a phase directly, without the server
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project with an isolated store
    Create {
        name: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, default_value = "null")]
        engine: String,
    },
    /// List registered projects
    List,
    /// Delete a project and everything it owns
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Plan tasks from a specification file
    Planner {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        spec_file: PathBuf,
    },
    /// Design architecture for one task
    Architect {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        task: i64,
    },
    /// Execute one approved task, or drain all ready tasks
    Coder {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        task: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port } => {
            start_server(ServerConfig {
                port,
                data_dir: cli.data_dir,
            })
            .await
        }
        Commands::Project { command } => run_project_command(&cli.data_dir, command),
        Commands::Run { command } => run_phase_command(&cli.data_dir, command).await,
    }
}

fn open_workspace(data_dir: &PathBuf) -> Result<Arc<Workspace>> {
    let workspace = Workspace::open(data_dir, EventBus::default())
        .context("failed to open workspace")?;
    Ok(Arc::new(workspace))
}

fn run_project_command(data_dir: &PathBuf, command: ProjectCommands) -> Result<()> {
    let workspace = open_workspace(data_dir)?;
    match command {
        ProjectCommands::Create { name, root, engine } => {
            let project = workspace.create_project(&name, root.as_deref(), &engine)?;
            println!(
                "created project {} (id {}) at {}",
                project.name, project.id, project.root_path
            );
        }
        ProjectCommands::List => {
            for project in workspace.list_projects()? {
                println!(
                    "{:>4}  {:<24} phase={:<16} engine={}",
                    project.id,
                    project.name,
                    project
                        .current_phase
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    project.default_engine,
                );
            }
        }
        ProjectCommands::Delete { id } => {
            workspace.delete_project(id)?;
            println!("deleted project {id}");
        }
    }
    Ok(())
}

async fn run_phase_command(data_dir: &PathBuf, command: RunCommands) -> Result<()> {
    let workspace = open_workspace(data_dir)?;
    let _audit = workspace.spawn_audit_writer();
    let engines = Arc::new(build_engine_registry());

    match command {
        RunCommands::Planner { project, spec_file } => {
            let ctx = ProjectContext::build(&workspace, project, engines)?;
            let spec = std::fs::read_to_string(&spec_file)
                .with_context(|| format!("failed to read {}", spec_file.display()))?;
            let outcome = planner::run_planner(&ctx, planner::SpecInput::Text(spec)).await?;
            println!(
                "planner run {} produced {} tasks (plan artifact {})",
                outcome.run.id,
                outcome.tasks.len(),
                outcome.plan_artifact.id,
            );
            for task in &outcome.tasks {
                println!("  task {:>4}  {}", task.id, task.title);
            }
        }
        RunCommands::Architect { project, task } => {
            let ctx = ProjectContext::build(&workspace, project, engines)?;
            let outcome = architect::run_architect(&ctx, task).await?;
            println!(
                "architect run {} produced {} options and {} ADRs",
                outcome.run.id,
                outcome.architecture.options.len(),
                outcome.adr_artifacts.len(),
            );
        }
        RunCommands::Coder { project, task } => {
            let ctx = ProjectContext::build(&workspace, project, engines)?;
            match task {
                Some(task_id) => {
                    let outcome = coder::run_coder_task(&ctx, task_id).await?;
                    println!(
                        "coder run {}: task {} is now {} (gates {})",
                        outcome.run.id,
                        outcome.task.id,
                        outcome.task.status,
                        outcome.gates.tally(),
                    );
                    if let Some(sha) = outcome.committed {
                        println!("  committed {sha}");
                    }
                }
                None => {
                    let report = coder::run_coder_loop(&ctx).await?;
                    println!(
                        "coder loop executed {} runs, stopped: {:?}",
                        report.executed.len(),
                        report.stopped,
                    );
                }
            }
        }
    }
    Ok(())
}
