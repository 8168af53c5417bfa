use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hive::config::WorkspacePaths;

mod cmd;

#[derive(Parser)]
#[command(name = "hive")]
#[command(version, about = "Multi-agent development orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace directory (defaults to the current directory).
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a hive workspace in the current directory
    Init,
    /// Register a repository as a team under orchestration
    AddRepo {
        name: String,
        repo_url: String,
        /// Checkout path relative to the workspace root
        repo_path: String,
    },
    /// Submit a requirement for planning
    Req {
        text: String,
        /// Force the most capable model on all derived agents
        #[arg(long)]
        godmode: bool,
        #[arg(long, default_value = "main")]
        target_branch: String,
    },
    /// Show teams, stories, and agents
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List stories
    Stories {
        #[arg(long)]
        status: Option<String>,
    },
    /// Run one assignment pass
    Assign,
    /// Inter-session messages
    Msg {
        #[command(subcommand)]
        command: MsgCommands,
    },
    /// Pending escalations
    Escalations {
        #[command(subcommand)]
        command: Option<EscalationCommands>,
    },
    /// The supervision daemon
    Manager {
        #[command(subcommand)]
        command: ManagerCommands,
    },
}

#[derive(Subcommand)]
pub enum MsgCommands {
    /// Queue a message for another session
    Send {
        from: String,
        to: String,
        body: String,
        #[arg(long)]
        subject: Option<String>,
    },
    /// List messages for a session (pending only by default)
    Inbox {
        session: String,
        #[arg(long)]
        all: bool,
    },
    /// Read one message (marks it read)
    Read { id: i64 },
    /// Reply to a message
    Reply { id: i64, body: String },
}

#[derive(Subcommand, Clone)]
pub enum EscalationCommands {
    /// List pending escalations
    List,
    /// Resolve an escalation
    Resolve { id: i64, resolution: String },
}

#[derive(Subcommand, Clone)]
pub enum ManagerCommands {
    /// Run the supervision loop in the foreground
    Start,
    /// Run a single supervision tick and print the summary
    Check,
    /// Show whether the manager is running
    Status,
    /// Stop the manager session and clear a stale lock
    Stop,
    /// Send a manual nudge into a session
    Nudge { session: String },
}

fn init_tracing(cli: &Cli, paths: &WorkspacePaths) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if cli.verbose { "hive=debug" } else { "hive=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // The daemon logs to a file inside the workspace; everything else logs
    // to stderr.
    if matches!(
        cli.command,
        Commands::Manager {
            command: ManagerCommands::Start
        }
    ) && paths.hive_dir.exists()
    {
        let appender = tracing_appender::rolling::never(&paths.hive_dir, hive::config::LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Some(guard);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = init_tracing(&cli, &WorkspacePaths::new(&workspace));

    match &cli.command {
        Commands::Init => cmd::cmd_init(&workspace)?,
        Commands::AddRepo {
            name,
            repo_url,
            repo_path,
        } => cmd::cmd_add_repo(&workspace, name, repo_url, repo_path).await?,
        Commands::Req {
            text,
            godmode,
            target_branch,
        } => cmd::cmd_req(&workspace, text, *godmode, target_branch).await?,
        Commands::Status { json } => cmd::cmd_status(&workspace, *json).await?,
        Commands::Stories { status } => cmd::cmd_stories(&workspace, status.as_deref()).await?,
        Commands::Assign => cmd::cmd_assign(&workspace).await?,
        Commands::Msg { command } => cmd::cmd_msg(&workspace, command).await?,
        Commands::Escalations { command } => {
            let command = command.clone().unwrap_or(EscalationCommands::List);
            cmd::cmd_escalations(&workspace, &command).await?;
        }
        Commands::Manager { command } => cmd::cmd_manager(&workspace, command).await?,
    }

    Ok(())
}
