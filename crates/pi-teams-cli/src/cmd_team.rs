//! The `/team` command surface, dispatched onto the coordinator.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Subcommand;
use pi_teams_conductor::coordinator::{Coordinator, TeamsAction};
use pi_teams_conductor::env::TeamsEnv;
use pi_teams_conductor::spawn::{ContextMode, ProcessLauncher, SpawnRequest, WorkspaceMode};
use pi_teams_core::TaskStatus;
use pi_teams_store::claim::AcquireOutcome;
use pi_teams_store::discover::list_discovered_teams;
use pi_teams_store::tasks::NewTask;
use tokio_util::sync::CancellationToken;

#[derive(Subcommand)]
pub enum TeamCommand {
    /// Spawn a worker: `spawn [NAME] [fresh|branch] [shared|worktree] [plan]`
    Spawn {
        /// Positional tokens: an optional worker name plus the
        /// `fresh|branch`, `shared|worktree`, and `plan` keywords
        args: Vec<String>,
        /// Model override: `provider/model` or a bare model id
        #[arg(long)]
        model: Option<String>,
        /// Thinking level for the worker
        #[arg(long)]
        thinking: Option<String>,
    },
    /// Attach to a team: `attach list` or `attach <teamId> [--claim]`
    Attach {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Release the attach claim on the current team
    Detach,
    /// Direct-message a member
    Dm {
        name: String,
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Message every worker
    Broadcast {
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Alias for `dm`
    Send {
        name: String,
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Steer a running worker mid-stream
    Steer {
        name: String,
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Task list operations
    Task {
        #[command(subcommand)]
        cmd: TaskCommand,
    },
    /// Kill a worker immediately
    Kill { name: String },
    /// Request shutdown of one worker, or of all online workers
    Shutdown { name: Option<String> },
    /// Show teams on disk with claim freshness, members, and tasks
    Status,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Add a task to the team task list
    Add {
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// List the team task list
    List,
}

// ── Spawn argument grammar ──

#[derive(Debug, PartialEq, Eq)]
pub struct SpawnTokens {
    pub name: Option<String>,
    pub mode: ContextMode,
    pub workspace_mode: WorkspaceMode,
    pub plan_required: bool,
}

/// Parse `/team spawn` positional tokens. The mode keywords may appear
/// in any order; the first non-keyword token is the worker name.
pub fn parse_spawn_args(args: &[String]) -> Result<SpawnTokens, String> {
    let mut tokens = SpawnTokens {
        name: None,
        mode: ContextMode::default(),
        workspace_mode: WorkspaceMode::default(),
        plan_required: false,
    };
    for arg in args {
        if let Some(mode) = ContextMode::parse(arg) {
            tokens.mode = mode;
        } else if let Some(workspace) = WorkspaceMode::parse(arg) {
            tokens.workspace_mode = workspace;
        } else if arg == "plan" {
            tokens.plan_required = true;
        } else if arg.starts_with("--") {
            return Err(format!("unknown flag {arg} for /team spawn"));
        } else if tokens.name.is_none() {
            tokens.name = Some(arg.clone());
        } else {
            return Err(
                "usage: /team spawn <name?> [fresh|branch] [shared|worktree] [plan]".into(),
            );
        }
    }
    Ok(tokens)
}

// ── Attach argument grammar ──

#[derive(Debug, PartialEq, Eq)]
pub enum AttachTarget {
    List,
    Team(String),
}

#[derive(Debug, PartialEq, Eq)]
pub struct AttachArgs {
    pub target: AttachTarget,
    pub claim: bool,
}

/// Parse `/team attach` arguments. Unknown `--` flags get a specific
/// error; a missing target gets a usage notification.
pub fn parse_attach_args(args: &[String]) -> Result<AttachArgs, String> {
    let mut claim = false;
    let mut target: Option<String> = None;
    for arg in args {
        if arg == "--claim" {
            claim = true;
        } else if arg.starts_with("--") {
            return Err(format!("unknown flag {arg} for /team attach"));
        } else if target.is_none() {
            target = Some(arg.clone());
        } else {
            return Err("usage: /team attach list | /team attach <teamId> [--claim]".into());
        }
    }
    match target {
        None => Err("usage: /team attach list | /team attach <teamId> [--claim]".into()),
        Some(t) if t == "list" => Ok(AttachArgs {
            target: AttachTarget::List,
            claim,
        }),
        Some(t) => Ok(AttachArgs {
            target: AttachTarget::Team(t),
            claim,
        }),
    }
}

// ── Dispatch ──

pub async fn run(cmd: TeamCommand) -> ExitCode {
    let env = TeamsEnv::from_env();
    match dispatch(env, cmd).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pi-teams: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(env: TeamsEnv, cmd: TeamCommand) -> Result<ExitCode> {
    match cmd {
        TeamCommand::Status => {
            print_status(&env);
            Ok(ExitCode::SUCCESS)
        }
        TeamCommand::Attach { args } => attach(env, &args),
        other => {
            let coord = open_coordinator(&env)?;
            if env.auto_claim {
                claim_or_warn(&coord)?;
            }
            dispatch_with_coordinator(&coord, other).await
        }
    }
}

async fn dispatch_with_coordinator(coord: &Coordinator, cmd: TeamCommand) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let action = match cmd {
        TeamCommand::Spawn {
            args,
            model,
            thinking,
        } => {
            let tokens = parse_spawn_args(&args).map_err(|msg| anyhow::anyhow!(msg))?;
            TeamsAction::MemberSpawn(SpawnRequest {
                name: tokens.name,
                mode: tokens.mode,
                workspace_mode: tokens.workspace_mode,
                plan_required: tokens.plan_required,
                model,
                thinking,
            })
        }
        TeamCommand::Detach => {
            coord.detach()?;
            println!("detached from team {}", coord.team_id());
            return Ok(ExitCode::SUCCESS);
        }
        TeamCommand::Dm { name, message } | TeamCommand::Send { name, message } => {
            TeamsAction::MessageDm {
                to: name,
                text: message.join(" "),
            }
        }
        TeamCommand::Broadcast { message } => TeamsAction::MessageBroadcast {
            text: message.join(" "),
        },
        TeamCommand::Steer { name, message } => TeamsAction::MessageSteer {
            to: name,
            text: message.join(" "),
        },
        TeamCommand::Task { cmd } => return task_command(coord, cmd),
        TeamCommand::Kill { name } => TeamsAction::MemberKill { name },
        TeamCommand::Shutdown { name } => TeamsAction::MemberShutdown {
            name: name.filter(|n| n.as_str() != "all"),
        },
        TeamCommand::Attach { .. } | TeamCommand::Status => unreachable!("handled above"),
    };

    let result = coord.handle(action, &cancel).await;
    println!("{}", result.content);
    Ok(if result.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn open_coordinator(env: &TeamsEnv) -> Result<Coordinator> {
    let team_id = env
        .team_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no team selected; set PI_TEAMS_TEAM_ID or use /team attach"))?;
    let session_id = uuid::Uuid::new_v4().to_string();
    Coordinator::new(env.clone(), &team_id, &session_id, Arc::new(ProcessLauncher))
}

fn claim_or_warn(coord: &Coordinator) -> Result<()> {
    match coord.attach(false)? {
        AcquireOutcome::Acquired { .. } => Ok(()),
        AcquireOutcome::ClaimedByOther { claim } => {
            anyhow::bail!(
                "team is claimed by session {}; re-attach with --claim to take over",
                claim.holder_session_id
            )
        }
    }
}

fn attach(env: TeamsEnv, args: &[String]) -> Result<ExitCode> {
    let parsed = match parse_attach_args(args) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("pi-teams: {msg}");
            return Ok(ExitCode::FAILURE);
        }
    };

    match parsed.target {
        AttachTarget::List => {
            print_status(&env);
            Ok(ExitCode::SUCCESS)
        }
        AttachTarget::Team(team_id) => {
            let mut env = env;
            env.team_id = Some(team_id.clone());
            let coord = open_coordinator(&env)?;
            match coord.attach(parsed.claim)? {
                AcquireOutcome::Acquired { replaced, .. } => {
                    match replaced {
                        Some(old) => println!(
                            "attached to {team_id} (took over from session {})",
                            old.holder_session_id
                        ),
                        None => println!("attached to {team_id}"),
                    }
                    Ok(ExitCode::SUCCESS)
                }
                AcquireOutcome::ClaimedByOther { claim } => {
                    eprintln!(
                        "pi-teams: {team_id} is claimed by session {}; pass --claim to take over",
                        claim.holder_session_id
                    );
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn task_command(coord: &Coordinator, cmd: TaskCommand) -> Result<ExitCode> {
    match cmd {
        TaskCommand::Add { text } => {
            let task = coord.store().create_task(NewTask {
                description: text.join(" "),
                ..Default::default()
            })?;
            println!("created task #{}: {}", task.id, task.subject);
        }
        TaskCommand::List => {
            let tasks = coord.store().list_tasks();
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in tasks {
                let owner = task.owner.as_deref().unwrap_or("-");
                let blocked = if coord.store().is_blocked(&task) {
                    " [blocked]"
                } else {
                    ""
                };
                println!(
                    "#{} [{}] {} (owner: {}){}",
                    task.id,
                    status_glyph(task.status),
                    task.subject,
                    owner,
                    blocked
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn status_glyph(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => " ",
        TaskStatus::InProgress => "~",
        TaskStatus::Completed => "x",
    }
}

fn print_status(env: &TeamsEnv) {
    let teams = list_discovered_teams(&env.root_dir);
    if teams.is_empty() {
        println!("no teams under {}", env.root_dir.display());
        return;
    }
    for team in teams {
        let claim = match (&team.claim, team.claim_fresh) {
            (Some(c), true) => format!("claimed by {}", c.holder_session_id),
            (Some(c), false) => format!("stale claim from {}", c.holder_session_id),
            (None, _) => "unclaimed".to_string(),
        };
        let workers = team.config.workers().count();
        println!(
            "{} - lead {}, {} worker(s), {}",
            team.team_id, team.config.lead_name, workers, claim
        );
    }
}
