use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strand_core::config::AppConfig;
use strand_core::session::WorkflowSession;
use strand_core::traits::WorkflowStore;
use strand_memory::{JsonQueue, QueueItem, QueueStatus, SqliteSessionStore};

#[derive(Parser)]
#[command(name = "strand", version, about = "Admin tool for strand workflow queues and sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit the deferred-run queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Inspect and edit persisted workflow sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Queue a run for later execution
    Submit {
        #[arg(long)]
        workflow: String,
        #[arg(long)]
        sequence: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Message for the run
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Show the next queued run of a workflow
    Next {
        #[arg(long)]
        workflow: String,
    },
    /// Set the status of a run
    Status {
        run_id: String,
        /// queued, running, completed or failed
        status: QueueStatus,
    },
    /// List queued runs (or runs with the given status)
    List {
        #[arg(long)]
        status: Option<QueueStatus>,
    },
    /// Count runs by status and workflow
    Stats,
    /// Drop completed and failed runs
    Clear,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, most recent first
    List {
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Show one session as JSON
    Show { session_id: String },
    /// Set a session's display name
    Rename { session_id: String, name: String },
    /// Delete a session and its runs
    Delete { session_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Queue { action } => {
            let queue = JsonQueue::open(config.queue_path())
                .with_context(|| format!("opening queue {}", config.queue_path().display()))?;
            handle_queue(&queue, action)
        }
        Commands::Sessions { action } => {
            let db_path = config.db_path();
            let store = SqliteSessionStore::open(&db_path)
                .with_context(|| format!("opening session store {}", db_path.display()))?;
            handle_sessions(&store, action).await
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# workspace: {}", config.workspace_dir().display());
            println!("# sessions:  {}", config.db_path().display());
            println!("# queue:     {}", config.queue_path().display());
            println!("# logs:      {}", config.log_dir().display());
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".strand").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

fn handle_queue(queue: &JsonQueue, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Submit {
            workflow,
            sequence,
            user,
            session,
            query,
        } => {
            let run_id = queue.submit(
                &workflow,
                &query.join(" "),
                &sequence,
                user.as_deref(),
                session.as_deref(),
            )?;
            println!("{}", run_id);
        }
        QueueAction::Next { workflow } => match queue.get_next_queued(&workflow)? {
            Some(item) => print_item(&item),
            None => println!("No queued runs for {}.", workflow),
        },
        QueueAction::Status { run_id, status } => {
            if queue.update_status(&run_id, status)? {
                println!("{} -> {}", run_id, status);
            } else {
                anyhow::bail!("run {} not found in queue", run_id);
            }
        }
        QueueAction::List { status } => {
            let items = match status {
                Some(status) => queue.get_by_status(status)?,
                None => queue.get_all_queued()?,
            };
            if items.is_empty() {
                println!("Queue is empty.");
            }
            for item in &items {
                print_item(item);
            }
        }
        QueueAction::Stats => {
            let stats = queue.get_stats()?;
            println!("Total: {}", stats.total);
            println!("By status:");
            for (status, count) in &stats.by_status {
                println!("  {:<10} {}", status, count);
            }
            println!("By workflow:");
            for (workflow, count) in &stats.by_workflow {
                println!("  {:<24} {}", workflow, count);
            }
        }
        QueueAction::Clear => {
            let removed = queue.clear_completed()?;
            println!("Removed {} finished run(s).", removed);
        }
    }
    Ok(())
}

fn print_item(item: &QueueItem) {
    println!(
        "{}  [{}]  {}/{}  {}",
        item.run_id, item.status, item.workflow_id, item.sequence_name, item.query
    );
}

async fn handle_sessions(store: &dyn WorkflowStore, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::List { workflow } => {
            let sessions = store.list_sessions(workflow.as_deref()).await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for session in &sessions {
                print_session(session);
            }
        }
        SessionAction::Show { session_id } => match store.read_session(&session_id).await? {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => anyhow::bail!("session {} not found", session_id),
        },
        SessionAction::Rename { session_id, name } => {
            if !store.rename_session(&session_id, &name).await? {
                anyhow::bail!("session {} not found", session_id);
            }
            println!("Renamed {} to {:?}", session_id, name);
        }
        SessionAction::Delete { session_id } => {
            if !store.delete_session(&session_id).await? {
                anyhow::bail!("session {} not found", session_id);
            }
            println!("Deleted {}", session_id);
        }
    }
    Ok(())
}

fn print_session(session: &WorkflowSession) {
    println!(
        "{}  {:<20} workflow={} runs={} updated={}",
        session.session_id,
        session.session_name().unwrap_or("-"),
        session.workflow_id,
        session.runs.len(),
        session.updated_at.format("%Y-%m-%d %H:%M")
    );
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
