use std::io::Read as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use directories::BaseDirs;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use aleph::arbiter::Arbiter;
use aleph::config::AlephConfig;
use aleph::dispatcher::{PushDispatcher, TurnTracker};
use aleph::hook_bus::{
    HookBus, InboxCheckHook, PermissionHook, ReadTrackingHook, ReminderHook,
};
use aleph::hook_service::{forward, HookService};
use aleph::ipc::{HookInput, HookRequest, StopOutput};
use aleph::runtime::{spawn_runtime, RuntimeHandle};
use aleph::session;
use aleph::spawner::{self, SpawnSpec};
use aleph::ui::{UiBridge, UiEvent};

use aleph_core::agent::{AgentLifecycleEvent, AgentRecord, AgentState};
use aleph_core::board::{TaskBoard, TaskStatus};
use aleph_core::channel::ChannelRegistry;
use aleph_core::hooks::HookEventName;
use aleph_core::inbox::{Draft, InboxStore, PrunePolicy};
use aleph_core::message::Priority;
use aleph_core::paths::{compute_paths, AlephPaths, PathInputs};
use aleph_core::permissions::PermissionMode;
use aleph_core::registry::Registry;
use aleph_core::stream::{user_turn, RuntimeEvent};

const REMINDER_INTERVAL: u64 = 25;
const WATCH_INTERVAL: Duration = Duration::from_millis(200);
const SUMMARY_WAIT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "aleph",
    version,
    about = "Aleph — persistent multi-agent personal assistant harness"
)]
struct Cli {
    /// Agent identifier (generated when omitted).
    #[arg(long)]
    id: Option<String>,

    /// Initial prompt, delivered as the first user-turn.
    #[arg(long)]
    prompt: Option<String>,

    /// Project directory (sets the working directory).
    #[arg(long)]
    project: Option<PathBuf>,

    /// Parent agent id, for spawned subagents.
    #[arg(long)]
    parent: Option<String>,

    /// Spawning depth, for recursion control.
    #[arg(long, default_value_t = 0)]
    depth: u32,

    /// Permission mode.
    #[arg(long, default_value_t = PermissionMode::Default)]
    mode: PermissionMode,

    /// Skip handoffs, session recaps, and the exit summary.
    #[arg(long)]
    ephemeral: bool,

    /// Launch into a detached tmux window instead of this terminal.
    #[arg(long)]
    detach: bool,

    /// Model passed through to the runtime.
    #[arg(long)]
    model: Option<String>,

    /// Continue the most recent runtime conversation.
    #[arg(long = "continue")]
    continue_session: bool,

    #[arg(long, global = true, value_name = "DIR", env = "ALEPH_HOME")]
    aleph_home: Option<PathBuf>,

    #[arg(long, global = true, env = "ALEPH_LOG", value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forward a runtime hook to the owning agent's socket.
    #[command(hide = true)]
    Hook {
        event: String,
        #[arg(long)]
        socket_path: PathBuf,
    },
    /// Spawn a subagent in a tmux window.
    Spawn {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long)]
        mode: Option<PermissionMode>,
        #[arg(long)]
        ephemeral: bool,
    },
    /// Live-agent registry operations.
    Agents {
        #[command(subcommand)]
        command: AgentsCommand,
    },
    /// Inter-agent mail.
    Inbox {
        #[command(subcommand)]
        command: InboxCommand,
    },
    /// Channel pub/sub.
    Channel {
        #[command(subcommand)]
        command: ChannelCommand,
    },
    /// The shared task board.
    Board {
        #[command(subcommand)]
        command: BoardCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AgentsCommand {
    List,
    Kill { id: String },
}

#[derive(Subcommand, Debug)]
enum InboxCommand {
    Send {
        to: String,
        #[arg(long)]
        summary: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    List {
        #[arg(long)]
        agent: Option<String>,
    },
    MarkRead {
        message_id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    Prune {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        max_count: Option<usize>,
        #[arg(long, value_name = "SECONDS")]
        older_than: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum ChannelCommand {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Send {
        channel: String,
        text: String,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    Members {
        channel: String,
    },
    Tail {
        channel: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum BoardCommand {
    List {
        #[arg(long, default_value = "TODO.yml")]
        file: PathBuf,
    },
    Claim {
        task_id: String,
        #[arg(long, default_value = "TODO.yml")]
        file: PathBuf,
    },
    Status {
        task_id: String,
        status: String,
        #[arg(long, default_value = "TODO.yml")]
        file: PathBuf,
    },
    Release {
        task_id: String,
        #[arg(long, default_value = "TODO.yml")]
        file: PathBuf,
    },
}

/// Exit codes: 0 clean, 1 user error, 2 internal error.
enum Failure {
    User(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Failure::Internal(err)
    }
}

fn user_error(msg: impl Into<String>) -> Failure {
    Failure::User(msg.into())
}

fn internal<E: Into<anyhow::Error>>(err: E) -> Failure {
    Failure::Internal(err.into())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version print through the normal path.
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::from(1);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::User(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(1)
        }
        Err(Failure::Internal(err)) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn resolve_paths(cli_home: Option<PathBuf>) -> Result<AlephPaths, Failure> {
    let home_dir = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| user_error("could not determine home directory"))?;
    Ok(compute_paths(PathInputs {
        home_dir,
        aleph_home_override: cli_home,
    }))
}

fn init_logging(paths: &AlephPaths, log_level: Option<&str>) -> anyhow::Result<()> {
    let dir_ok = std::fs::create_dir_all(&paths.logs_dir).is_ok();

    let level = log_level
        .map(str::to_owned)
        .or_else(|| std::env::var("ALEPH_LOG").ok())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_owned());
    let filter = EnvFilter::try_new(level).context("parse log level")?;

    let file_layer = if dir_ok {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::NEVER)
            .filename_prefix("aleph")
            .filename_suffix("log")
            .build(&paths.logs_dir)
            .ok()
            .map(|appender| {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
            })
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();
    Ok(())
}

fn parse_priority(text: &str) -> Result<Priority, Failure> {
    match text.trim().to_ascii_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        other => Err(user_error(format!("unknown priority: {other:?}"))),
    }
}

fn parse_status(text: &str) -> Result<TaskStatus, Failure> {
    match text.trim().to_ascii_lowercase().as_str() {
        "open" => Ok(TaskStatus::Open),
        "claimed" => Ok(TaskStatus::Claimed),
        "in-progress" => Ok(TaskStatus::InProgress),
        "done" => Ok(TaskStatus::Done),
        "blocked" => Ok(TaskStatus::Blocked),
        other => Err(user_error(format!("unknown status: {other:?}"))),
    }
}

fn env_agent_id() -> Option<String> {
    std::env::var("ALEPH_AGENT_ID")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Agent id for maintenance commands: explicit flag, else the identity the
/// runtime exported to this shell.
fn ambient_agent_id(explicit: Option<String>) -> Result<String, Failure> {
    explicit
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .or_else(env_agent_id)
        .ok_or_else(|| user_error("no agent id: pass --agent or set ALEPH_AGENT_ID"))
}

async fn run(cli: Cli) -> Result<(), Failure> {
    let paths = resolve_paths(cli.aleph_home.clone())?;

    match cli.command {
        Some(Command::Hook { event, socket_path }) => {
            // No logging init here: hook forwarders must leave stdout pure.
            run_hook_forwarder(&event, &socket_path).await;
            Ok(())
        }
        Some(command) => run_maintenance(command, &paths).await,
        None => {
            init_logging(&paths, cli.log_level.as_deref())?;
            let config = AlephConfig {
                agent_id: cli.id,
                project: cli.project,
                model: cli.model,
                prompt: cli.prompt,
                parent: cli.parent,
                depth: cli.depth,
                mode: cli.mode,
                ephemeral: cli.ephemeral,
                detach: cli.detach,
                continue_session: cli.continue_session,
            };
            if config.detach {
                return run_detached(&paths, &config).await;
            }
            run_session(paths, config).await
        }
    }
}

/// `aleph hook <event>`: stdin -> socket -> stdout. Never breaks the
/// runtime: on any failure the output degrades to `{}` (or a deny for the
/// permission gate, which fails closed).
async fn run_hook_forwarder(event: &str, socket_path: &std::path::Path) {
    let event_name = match event {
        "PreToolUse" => HookEventName::PreToolUse,
        "PostToolUse" => HookEventName::PostToolUse,
        "SessionStart" => HookEventName::SessionStart,
        "Stop" => HookEventName::Stop,
        _ => {
            println!("{{}}");
            return;
        }
    };

    let mut buf = String::new();
    if std::io::stdin().read_to_string(&mut buf).is_err() {
        println!("{{}}");
        return;
    }
    let input: HookInput = serde_json::from_str(&buf).unwrap_or_default();

    let request = HookRequest {
        event: event_name,
        input,
    };
    match forward(socket_path, &request).await {
        Ok(response) => {
            if event_name == HookEventName::Stop {
                if response.force_continue {
                    let out = StopOutput {
                        decision: "block",
                        reason: response.context,
                    };
                    println!(
                        "{}",
                        serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_owned())
                    );
                } else {
                    println!("{{}}");
                }
            } else {
                println!(
                    "{}",
                    serde_json::to_string(&response.output)
                        .unwrap_or_else(|_| "{}".to_owned())
                );
            }
        }
        Err(err) => {
            if event_name == HookEventName::PreToolUse {
                let envelope = serde_json::json!({
                    "hookSpecificOutput": {
                        "hookEventName": "PreToolUse",
                        "permissionDecision": "deny",
                        "permissionDecisionReason":
                            format!("permission request failed: {err:#}"),
                    }
                });
                println!("{envelope}");
            } else {
                println!("{{}}");
            }
        }
    }
}

async fn run_maintenance(command: Command, paths: &AlephPaths) -> Result<(), Failure> {
    let inbox = InboxStore::new(paths.inbox_dir.clone(), paths.quarantine_dir.clone());
    let channels = ChannelRegistry::new(paths.channels_dir.clone());
    let registry = Registry::new(paths.registry_dir.clone());

    match command {
        Command::Hook { .. } => unreachable!("handled by the caller"),
        Command::Spawn {
            prompt,
            id,
            project,
            mode,
            ephemeral,
        } => {
            let parent_id = env_agent_id().unwrap_or_else(|| "operator".to_owned());
            let parent_depth: u32 = std::env::var("ALEPH_DEPTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let spec = SpawnSpec {
                parent_id,
                depth: parent_depth + 1,
                agent_id: id,
                prompt: Some(prompt),
                project,
                mode: mode.unwrap_or_default(),
                ephemeral,
            };
            match spawner::spawn_subagent(paths, &spec).await {
                Ok(agent_id) => {
                    println!("{agent_id}");
                    Ok(())
                }
                Err(err @ spawner::SpawnError::DepthExceeded { .. }) => {
                    Err(user_error(err.to_string()))
                }
                Err(err) => Err(internal(err)),
            }
        }
        Command::Agents { command } => match command {
            AgentsCommand::List => {
                for record in spawner::list_alive(&registry).map_err(internal)? {
                    println!(
                        "{}\tpid={}\tdepth={}\tstate={:?}\tmode={}",
                        record.agent_id, record.pid, record.depth, record.state, record.mode
                    );
                }
                Ok(())
            }
            AgentsCommand::Kill { id } => {
                spawner::kill(&registry, &id).map_err(internal)?;
                Ok(())
            }
        },
        Command::Inbox { command } => match command {
            InboxCommand::Send {
                to,
                summary,
                body,
                priority,
            } => {
                let from = env_agent_id().unwrap_or_else(|| "operator".to_owned());
                let draft = Draft {
                    from,
                    summary,
                    body,
                    priority: parse_priority(&priority)?,
                    channel: None,
                };
                let id = inbox.deliver(&to, &draft).map_err(internal)?;
                println!("{id}");
                Ok(())
            }
            InboxCommand::List { agent } => {
                let agent = ambient_agent_id(agent)?;
                let listing = inbox.list_unread(&agent).map_err(internal)?;
                for msg in listing.messages {
                    println!(
                        "{}\t{:?}\t{}\t{}",
                        msg.message_id, msg.priority, msg.from, msg.summary
                    );
                }
                Ok(())
            }
            InboxCommand::MarkRead { message_id, agent } => {
                let agent = ambient_agent_id(agent)?;
                inbox.mark_read(&agent, &message_id).map_err(internal)?;
                Ok(())
            }
            InboxCommand::Prune {
                agent,
                max_count,
                older_than,
            } => {
                let agent = ambient_agent_id(agent)?;
                let removed = inbox
                    .prune(
                        &agent,
                        PrunePolicy {
                            older_than: older_than.map(Duration::from_secs),
                            max_count,
                        },
                    )
                    .map_err(internal)?;
                println!("pruned {removed}");
                Ok(())
            }
        },
        Command::Channel { command } => match command {
            ChannelCommand::Subscribe { channel } => {
                let agent = ambient_agent_id(None)?;
                channels.subscribe(&agent, &channel).map_err(internal)?;
                Ok(())
            }
            ChannelCommand::Unsubscribe { channel } => {
                let agent = ambient_agent_id(None)?;
                channels.unsubscribe(&agent, &channel).map_err(internal)?;
                Ok(())
            }
            ChannelCommand::Send {
                channel,
                text,
                priority,
            } => {
                let agent = env_agent_id().unwrap_or_else(|| "operator".to_owned());
                let report = channels
                    .broadcast(&inbox, &agent, &channel, &text, "", parse_priority(&priority)?)
                    .map_err(internal)?;
                println!(
                    "delivered to {} subscriber(s){}",
                    report.delivered.len(),
                    if report.failed.is_empty() {
                        String::new()
                    } else {
                        format!(", {} failed", report.failed.len())
                    }
                );
                Ok(())
            }
            ChannelCommand::Members { channel } => {
                for member in channels.members(&channel).map_err(internal)? {
                    println!("{member}");
                }
                Ok(())
            }
            ChannelCommand::Tail { channel, limit } => {
                for entry in channels.catch_up(&channel, limit).map_err(internal)? {
                    println!("{}\t{}\t{}", entry.ts, entry.from, entry.summary);
                }
                Ok(())
            }
        },
        Command::Board { command } => {
            let agent = env_agent_id().unwrap_or_else(|| "operator".to_owned());
            match command {
                BoardCommand::List { file } => {
                    let tasks = TaskBoard::new(file).load().map_err(board_failure)?;
                    print_tasks(&tasks.tasks, 0);
                    Ok(())
                }
                BoardCommand::Claim { task_id, file } => {
                    let task = TaskBoard::new(file)
                        .claim(&task_id, &agent)
                        .map_err(board_failure)?;
                    println!("claimed {} ({})", task.id, task.description);
                    Ok(())
                }
                BoardCommand::Status {
                    task_id,
                    status,
                    file,
                } => {
                    let status = parse_status(&status)?;
                    let task = TaskBoard::new(file)
                        .set_status(&task_id, status, &agent)
                        .map_err(board_failure)?;
                    println!("{} -> {}", task.id, task.status);
                    Ok(())
                }
                BoardCommand::Release { task_id, file } => {
                    let task = TaskBoard::new(file)
                        .release(&task_id, &agent)
                        .map_err(board_failure)?;
                    println!("released {}", task.id);
                    Ok(())
                }
            }
        }
    }
}

fn board_failure(err: aleph_core::board::BoardError) -> Failure {
    use aleph_core::board::BoardError::*;
    match err {
        NotFound(_) | AlreadyClaimed { .. } | InvalidTransition { .. } | NotAssignee { .. } => {
            user_error(err.to_string())
        }
        other => internal(other),
    }
}

fn print_tasks(tasks: &[aleph_core::board::Task], indent: usize) {
    for task in tasks {
        println!(
            "{}{}\t{}\t{}{}",
            "  ".repeat(indent),
            task.id,
            task.status,
            task.description,
            task.assignee
                .as_deref()
                .map(|a| format!("\t@{a}"))
                .unwrap_or_default()
        );
        print_tasks(&task.subtasks, indent + 1);
    }
}

/// Re-launch this invocation inside a detached tmux window.
async fn run_detached(paths: &AlephPaths, config: &AlephConfig) -> Result<(), Failure> {
    let spec = SpawnSpec {
        parent_id: config
            .parent
            .clone()
            .unwrap_or_else(|| "operator".to_owned()),
        // Detach re-homes this session; it is not a nested spawn.
        depth: config.depth,
        agent_id: Some(config.resolve_agent_id()),
        prompt: config.prompt.clone(),
        project: config.project.clone(),
        mode: config.mode,
        ephemeral: config.ephemeral,
    };
    match spawner::spawn_subagent(paths, &spec).await {
        Ok(agent_id) => {
            println!("{agent_id}");
            Ok(())
        }
        Err(err @ spawner::SpawnError::DepthExceeded { .. }) => Err(user_error(err.to_string())),
        Err(err) => Err(internal(err)),
    }
}

fn ensure_home(paths: &AlephPaths) -> anyhow::Result<()> {
    for dir in [
        &paths.memory_dir,
        &paths.sessions_dir,
        &paths.inbox_dir,
        &paths.channels_dir,
        &paths.registry_dir,
        &paths.tools_dir,
        &paths.scratch_dir,
        &paths.plans_dir,
        &paths.logs_dir,
        &paths.quarantine_dir,
        &paths.harness_dir,
    ] {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(())
}

/// Why the inner event loop returned.
enum LoopExit {
    Quit,
    RuntimeDied,
}

struct SessionState {
    record: AgentRecord,
    registry: Registry,
    interrupted_once: bool,
}

impl SessionState {
    fn apply(&mut self, event: AgentLifecycleEvent) {
        self.record = self.record.apply_event(event, OffsetDateTime::now_utc());
        if let Err(err) = self.registry.write(&self.record) {
            tracing::warn!(error = %err, "registry write failed");
        }
    }
}

async fn run_session(paths: AlephPaths, config: AlephConfig) -> Result<(), Failure> {
    ensure_home(&paths)?;

    let agent_id = config.resolve_agent_id();
    let now = OffsetDateTime::now_utc();
    let registry = Registry::new(paths.registry_dir.clone());
    let record = AgentRecord::new(
        agent_id.clone(),
        std::process::id(),
        config.parent.clone(),
        config.depth,
        config
            .project
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned()),
        config.mode,
        config.ephemeral,
        now,
    );
    registry.write(&record).map_err(internal)?;
    let mut state = SessionState {
        record,
        registry,
        interrupted_once: false,
    };

    let (ui, mut ui_rx) = UiBridge::new();
    let inbox = Arc::new(InboxStore::new(
        paths.inbox_dir.clone(),
        paths.quarantine_dir.clone(),
    ));
    let turns = Arc::new(TurnTracker::new());
    let arbiter = Arc::new(Arbiter::new(config.mode, ui.clone()));

    let mut bus = HookBus::new();
    bus.register(
        HookEventName::PreToolUse,
        Arc::new(PermissionHook::new(arbiter.clone())),
    );
    bus.register(
        HookEventName::PostToolUse,
        Arc::new(InboxCheckHook::new(
            inbox.clone(),
            agent_id.clone(),
            turns.clone(),
        )),
    );
    bus.register(
        HookEventName::PostToolUse,
        Arc::new(ReadTrackingHook::new(inbox.clone(), agent_id.clone()).map_err(internal)?),
    );
    bus.register(
        HookEventName::PostToolUse,
        Arc::new(ReminderHook::new(REMINDER_INTERVAL, paths.memory_dir.clone())),
    );
    bus.register(
        HookEventName::Stop,
        Arc::new(InboxCheckHook::new(
            inbox.clone(),
            agent_id.clone(),
            turns.clone(),
        )),
    );
    let bus = Arc::new(bus);

    let socket_path = paths
        .hook_socket(&agent_id)
        .map_err(|err| user_error(format!("invalid agent id: {err}")))?;
    let (service, listener) = HookService::bind(&socket_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service_task = tokio::spawn({
        let bus = bus.clone();
        async move {
            service.serve(listener, bus, shutdown_rx).await;
        }
    });

    // Console plumbing: a printer task and a stdin line channel.
    let printer = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            print_ui_event(&event);
        }
    });
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdin_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let system_prompt = session::build_system_prompt(&paths, &config, &agent_id, now);
    let mut initial_prompt = config.prompt.clone();
    let mut reconnects_left: u32 = 1;

    let outcome: Result<LoopExit, Failure> = loop {
        let mut runtime =
            match spawn_runtime(&config, &paths, &agent_id, &socket_path, &system_prompt).await {
                Ok(handle) => handle,
                Err(err) => break Err(internal(err)),
            };
        state.apply(AgentLifecycleEvent::Ready);
        tracing::info!(agent_id = %agent_id, pid = runtime.pid, "runtime connected");

        let dispatcher = PushDispatcher::new(
            inbox.clone(),
            agent_id.clone(),
            turns.clone(),
            runtime.outbound_tx.clone(),
            ui.clone(),
        );

        if let Some(prompt) = initial_prompt.take() {
            let _ = runtime.outbound_tx.send(user_turn(prompt)).await;
            turns.on_user_turn();
            state.apply(AgentLifecycleEvent::TurnStarted);
        }

        let exit = drive_runtime(
            &mut runtime,
            &dispatcher,
            &arbiter,
            &turns,
            &ui,
            &mut state,
            &mut stdin_rx,
        )
        .await;

        match exit {
            LoopExit::Quit => {
                // Clean shutdown path owns the runtime for the summary turn.
                let result = finish_session(&paths, &config, &agent_id, &mut state, runtime).await;
                let _ = shutdown_tx.send(true);
                let _ = service_task.await;
                let _ = state.registry.remove(&agent_id);
                printer.abort();
                return result;
            }
            LoopExit::RuntimeDied => {
                runtime.shutdown().await;
                if reconnects_left > 0 {
                    reconnects_left -= 1;
                    ui.banner("runtime connection lost; reconnecting");
                    turns.on_turn_end();
                    continue;
                }
                let _ = session::write_emergency_handoff(
                    &paths,
                    &agent_id,
                    "runtime subprocess died twice",
                    OffsetDateTime::now_utc(),
                );
                break Err(Failure::Internal(anyhow!(
                    "runtime subprocess died and could not be restarted"
                )));
            }
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = service_task.await;
    let _ = state.registry.remove(&agent_id);
    printer.abort();
    outcome.map(|_| ())
}

async fn drive_runtime(
    runtime: &mut RuntimeHandle,
    dispatcher: &PushDispatcher,
    arbiter: &Arc<Arbiter>,
    turns: &Arc<TurnTracker>,
    ui: &UiBridge,
    state: &mut SessionState,
    stdin_rx: &mut mpsc::Receiver<String>,
) -> LoopExit {
    let mut watch_tick = tokio::time::interval(WATCH_INTERVAL);
    let mut heartbeat_tick = tokio::time::interval(aleph_core::registry::HEARTBEAT_INTERVAL);
    let mut exit_rx = runtime.exit_rx.clone();
    let outbound_tx = runtime.outbound_tx.clone();

    loop {
        tokio::select! {
            event = runtime.events_rx.recv() => {
                let Some(event) = event else {
                    return LoopExit::RuntimeDied;
                };
                handle_runtime_event(&event, turns, ui);
                match event {
                    RuntimeEvent::ToolUseStart { .. } => {
                        if state.record.state != AgentState::Busy {
                            state.apply(AgentLifecycleEvent::TurnStarted);
                        }
                    }
                    RuntimeEvent::TurnEnd { .. } => {
                        state.apply(AgentLifecycleEvent::TurnCompleted);
                        state.interrupted_once = false;
                    }
                    _ => {}
                }
            }
            line = stdin_rx.recv() => {
                let Some(line) = line else { return LoopExit::Quit };
                let trimmed = line.trim();
                if arbiter.has_pending().await {
                    let allow = matches!(trimmed, "y" | "Y" | "yes");
                    arbiter.resolve_current(allow).await;
                    continue;
                }
                match trimmed {
                    "" => {}
                    "/quit" | "/q" => return LoopExit::Quit,
                    "/mode" => {
                        let mode = arbiter.cycle_mode();
                        ui.info(format!("permission mode: {mode}"));
                    }
                    text => {
                        let _ = outbound_tx.send(user_turn(text)).await;
                        turns.on_user_turn();
                        state.apply(AgentLifecycleEvent::TurnStarted);
                    }
                }
            }
            _ = watch_tick.tick() => {
                dispatcher.tick().await;
            }
            _ = heartbeat_tick.tick() => {
                let now = OffsetDateTime::now_utc();
                let SessionState { record, registry, .. } = state;
                if let Err(err) = registry.heartbeat(record, now) {
                    tracing::warn!(error = %err, "heartbeat write failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if turns.is_busy() && !state.interrupted_once {
                    state.interrupted_once = true;
                    arbiter.interrupt().await;
                    state.apply(AgentLifecycleEvent::Interrupted);
                    ui.info("turn interrupted; Ctrl-C again to quit");
                } else {
                    return LoopExit::Quit;
                }
            }
            _ = exit_rx.changed() => {
                let code = *exit_rx.borrow();
                tracing::warn!(?code, "runtime exited");
                return LoopExit::RuntimeDied;
            }
        }
    }
}

/// Best-effort summary turn, memory commit, and runtime teardown.
async fn finish_session(
    paths: &AlephPaths,
    config: &AlephConfig,
    agent_id: &str,
    state: &mut SessionState,
    mut runtime: RuntimeHandle,
) -> Result<(), Failure> {
    state.apply(AgentLifecycleEvent::ShutdownRequested);

    if !config.ephemeral {
        let prompt = session::summary_prompt(paths, agent_id, OffsetDateTime::now_utc());
        let mut summarized = false;
        if runtime.outbound_tx.send(user_turn(prompt)).await.is_ok() {
            summarized = tokio::time::timeout(SUMMARY_WAIT, async {
                while let Some(event) = runtime.events_rx.recv().await {
                    if matches!(event, RuntimeEvent::TurnEnd { .. }) {
                        return true;
                    }
                }
                false
            })
            .await
            .unwrap_or(false);
        }
        if !summarized {
            let _ = session::write_stub_summary(paths, &state.record, OffsetDateTime::now_utc());
        }

        match session::commit_memory(&paths.aleph_home, agent_id).await {
            Ok(Some(summary)) => tracing::info!(%summary, "memory committed"),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "memory commit failed"),
        }
    }

    runtime.shutdown().await;
    state.apply(AgentLifecycleEvent::Exited);
    tracing::info!(agent_id = %agent_id, "session ended");
    Ok(())
}

fn handle_runtime_event(event: &RuntimeEvent, turns: &TurnTracker, ui: &UiBridge) {
    match event {
        RuntimeEvent::TextDelta(text) => ui.send(UiEvent::StreamText(text.clone())),
        RuntimeEvent::ThinkingDelta(text) => ui.send(UiEvent::StreamThinking(text.clone())),
        RuntimeEvent::ToolUseStart {
            tool_use_id,
            tool_name,
            arguments,
        } => {
            turns.on_tool_use_start();
            ui.send(UiEvent::ToolCallStart {
                tool_name: tool_name.clone(),
                input: arguments.clone(),
                tool_use_id: tool_use_id.clone(),
            });
        }
        RuntimeEvent::ToolUseComplete {
            result, is_error, ..
        } => {
            turns.on_tool_use_complete();
            ui.send(UiEvent::ToolCallResult {
                tool_name: String::new(),
                content: result.clone(),
                is_error: *is_error,
            });
        }
        RuntimeEvent::TurnEnd { result, is_error } => {
            turns.on_turn_end();
            ui.send(UiEvent::TurnComplete {
                result: result.clone(),
                is_error: *is_error,
            });
        }
    }
}

fn print_ui_event(event: &UiEvent) {
    match event {
        UiEvent::StreamText(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        UiEvent::StreamThinking(_) => {}
        UiEvent::ToolCallStart { tool_name, .. } => println!("\n[tool] {tool_name}"),
        UiEvent::ToolCallResult { is_error, .. } => {
            if *is_error {
                println!("[tool] failed");
            }
        }
        UiEvent::TurnComplete { .. } => println!("\n---"),
        UiEvent::PermissionPrompt(view) => {
            println!("\n[permission] {} wants to run:", view.tool_name);
            if let Some(diff) = &view.diff {
                println!("{diff}");
            }
            println!("allow? [y/N]");
        }
        UiEvent::Banner(text) => eprintln!("! {text}"),
        UiEvent::Info(text) => println!("{text}"),
    }
}
