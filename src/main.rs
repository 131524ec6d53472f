//! # Delegate CLI
//!
//! Multi-agent software-engineering orchestration daemon.
//!
//! Usage:
//!   delegate start                          # Run the daemon + gateway
//!   delegate bootstrap myteam --agents 3    # Create a team
//!   delegate repo add myteam ~/code/app     # Register a local repo
//!   delegate task list myteam               # Show the task board
//!   delegate send myteam worker "message"   # Drop a message in the mailbox

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use delegate_core::config::{ApprovalMode, GlobalConfig};
use delegate_core::paths::Home;
use delegate_core::types::MemberKind;
use delegate_daemon::{Daemon, DaemonConfig, DaemonSingleton};
use delegate_db::tasks::{self, TaskFilter};
use delegate_db::{ids::IdRegistry, mailbox, Db};
use delegate_gateway::AppState;
use delegate_merge::MergeContext;
use delegate_runtime::{ActivityHub, Runtime};
use delegate_telephone::{ProcessConnector, TelephoneExchange};
use delegate_workflows::WorkflowRegistry;

#[derive(Parser)]
#[command(
    name = "delegate",
    version,
    about = "Delegate — a team of AI agents working your task board",
    long_about = "Delegate routes messages between a human operator and a team of \
LLM-backed agents, manages per-task git worktrees, and merges approved work onto main."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the home directory (default ~/.delegate, or $DELEGATE_HOME)
    #[arg(long, global = true)]
    home: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and HTTP gateway
    Start {
        /// Gateway bind address
        #[arg(long, default_value = "127.0.0.1:8787")]
        listen: String,

        /// Poll interval in seconds
        #[arg(long, default_value = "1.0")]
        interval: f64,

        /// Agent SDK command (program + args) for the Telephone subprocesses
        #[arg(long, default_value = "claude-agent", num_args = 1..)]
        agent_cmd: Vec<String>,
    },

    /// Create a team with a manager and engineer agents
    Bootstrap {
        /// Team name
        team: String,

        /// Number of engineer agents
        #[arg(long, default_value = "2")]
        agents: u32,

        /// Model for the engineers
        #[arg(long, default_value = "sonnet")]
        model: String,
    },

    /// Manage registered repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Inspect tasks
    Task {
        #[command(subcommand)]
        action: TaskCmd,
    },

    /// Send a chat message to an agent
    Send {
        team: String,
        recipient: String,
        content: String,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Register a local repository for a team
    Add {
        team: String,
        /// Local path to the repository root (must contain .git/)
        path: String,
        /// Repo name (default: derived from the path)
        #[arg(long)]
        name: Option<String>,
        /// Merge on approval without a reviewer verdict
        #[arg(long)]
        auto_approve: bool,
    },

    /// List registered repositories
    List { team: String },
}

#[derive(Subcommand)]
enum TaskCmd {
    /// Show a team's task board
    List { team: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let home = Home::resolve(
        cli.home
            .map(|h| shellexpand::tilde(&h).to_string().into()),
    );

    match cli.command {
        Commands::Start {
            listen,
            interval,
            agent_cmd,
        } => start(home, listen, interval, agent_cmd).await,
        Commands::Bootstrap {
            team,
            agents,
            model,
        } => bootstrap(home, &team, agents, &model),
        Commands::Repo { action } => repo_command(home, action),
        Commands::Task { action } => task_command(home, action),
        Commands::Send {
            team,
            recipient,
            content,
        } => send_command(home, &team, &recipient, &content),
    }
}

async fn start(home: Home, listen: String, interval: f64, agent_cmd: Vec<String>) -> Result<()> {
    let _singleton = DaemonSingleton::acquire(&home)?;

    let db = Db::open(home.clone())?;
    let ids = IdRegistry::new();
    let workflows = Arc::new(WorkflowRegistry::new());
    let exchange = Arc::new(TelephoneExchange::new());
    let hub = Arc::new(ActivityHub::new());
    let connector = Arc::new(ProcessConnector::new(agent_cmd));

    let runtime = Arc::new(Runtime::new(
        db.clone(),
        ids.clone(),
        home.clone(),
        exchange.clone(),
        connector,
        hub.clone(),
        workflows.clone(),
    ));
    let merge = Arc::new(MergeContext {
        db: db.clone(),
        ids: ids.clone(),
        home: home.clone(),
        workflows: workflows.clone(),
        exchange: Some(exchange),
    });

    let daemon = Arc::new(Daemon::new(
        runtime,
        merge,
        DaemonConfig {
            interval: std::time::Duration::from_secs_f64(interval.max(0.1)),
            ..Default::default()
        },
    ));

    // Ctrl-C flips the shutdown flag; the loop drains and exits.
    let shutdown = daemon.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received — shutting down");
            shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let state = Arc::new(AppState {
        db,
        ids,
        home,
        hub,
        workflows,
    });
    let gateway = tokio::spawn(async move {
        if let Err(e) = delegate_gateway::serve(state, &listen).await {
            tracing::error!("gateway stopped: {e}");
        }
    });

    daemon.run().await?;
    gateway.abort();
    Ok(())
}

fn bootstrap(home: Home, team: &str, engineers: u32, model: &str) -> Result<()> {
    let db = Db::open(home.clone())?;
    let ids = IdRegistry::new();
    let conn = db.conn()?;

    let team_uuid = ids.register_team(&conn, team, None)?;
    conn.execute(
        "INSERT OR IGNORE INTO teams (name, team_id) VALUES (?1, ?2)",
        delegate_db::rusqlite::params![team, team_uuid],
    )?;
    std::fs::create_dir_all(home.protected_team_dir(team))?;
    std::fs::write(home.team_id_path(team), &team_uuid)?;
    std::fs::create_dir_all(home.shared_dir(&team_uuid))?;

    let mut roster: Vec<(String, String, String)> = vec![(
        "delegate".to_string(),
        "manager".to_string(),
        "opus".to_string(),
    )];
    for i in 1..=engineers {
        roster.push((format!("eng{i}"), "engineer".to_string(), model.to_string()));
    }
    for (name, role, model) in &roster {
        ids.register_member(&conn, MemberKind::Agent, Some(&team_uuid), name)?;
        let agent_dir = home.agent_dir(&team_uuid, name);
        std::fs::create_dir_all(agent_dir.join("notes"))?;
        std::fs::create_dir_all(agent_dir.join("logs"))?;
        std::fs::create_dir_all(agent_dir.join("journals"))?;
        std::fs::write(
            home.agent_state_path(&team_uuid, name),
            format!("role: {role}\nmodel: {model}\n"),
        )?;
    }

    // The first bootstrap records the operator as the default human.
    let mut cfg = GlobalConfig::load(&home)?;
    if cfg.default_human.is_none() {
        let user = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
        std::fs::create_dir_all(home.members_dir())?;
        std::fs::write(home.member_file(&user), format!("name: {user}\n"))?;
        ids.register_member(&conn, MemberKind::Human, None, &user)?;
        cfg.default_human = Some(user);
        cfg.save(&home)?;
    }

    println!("team '{team}' created ({team_uuid})");
    for (name, role, model) in &roster {
        println!("  {name} ({role}, {model})");
    }
    Ok(())
}

fn repo_command(home: Home, action: RepoAction) -> Result<()> {
    let db = Db::open(home.clone())?;
    let ids = IdRegistry::new();
    match action {
        RepoAction::Add {
            team,
            path,
            name,
            auto_approve,
        } => {
            let team_uuid = {
                let conn = db.conn()?;
                ids.resolve_team(&conn, &team)?
            };
            let approval = auto_approve.then_some(ApprovalMode::Auto);
            let name = delegate_git::register_repo(
                &home,
                &team,
                &team_uuid,
                &path,
                name.as_deref(),
                approval,
                None,
            )?;
            println!("registered repo '{name}' for team '{team}'");
        }
        RepoAction::List { team } => {
            let repos = delegate_core::config::read_repos(&home, &team)?;
            if repos.is_empty() {
                println!("no repos registered for team '{team}'");
            }
            for (name, cfg) in repos {
                println!("{name}\t{}\t{:?}", cfg.source, cfg.approval);
            }
        }
    }
    Ok(())
}

fn task_command(home: Home, action: TaskCmd) -> Result<()> {
    let db = Db::open(home)?;
    match action {
        TaskCmd::List { team } => {
            let conn = db.conn()?;
            let all = tasks::list_tasks(&conn, &team, TaskFilter::default())?;
            if all.is_empty() {
                println!("no tasks for team '{team}'");
            }
            for task in all {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.display_id(),
                    task.status,
                    task.assignee,
                    task.title
                );
            }
        }
    }
    Ok(())
}

fn send_command(home: Home, team: &str, recipient: &str, content: &str) -> Result<()> {
    let db = Db::open(home.clone())?;
    let ids = IdRegistry::new();
    let sender =
        delegate_core::config::default_human(&home).unwrap_or_else(|| "human".to_string());
    let conn = db.conn()?;
    let id = mailbox::send(&conn, &ids, team, &sender, recipient, content, None)?;
    println!("message {id} delivered to {recipient}");
    Ok(())
}
