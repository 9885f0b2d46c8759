//! Subagent spawning into tmux, depth enforcement, and liveness probes.

use std::path::PathBuf;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::Command;

use aleph_core::agent::AgentRecord;
use aleph_core::ids::generate_agent_id;
use aleph_core::paths::AlephPaths;
use aleph_core::permissions::PermissionMode;
use aleph_core::registry::{Registry, RegistryError};

pub const MAX_DEPTH: u32 = 3;

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub parent_id: String,
    /// The depth the child will run at (parent depth + 1 for a spawn).
    pub depth: u32,
    pub agent_id: Option<String>,
    pub prompt: Option<String>,
    pub project: Option<PathBuf>,
    pub mode: PermissionMode,
    pub ephemeral: bool,
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("spawn depth {requested} exceeds the limit of {max}")]
    DepthExceeded { requested: u32, max: u32 },
    #[error("tmux failed: {0}")]
    Tmux(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Launch a subagent in its own tmux window (or a fresh tmux session when
/// none is running), returning the child's id without waiting for it to
/// come up. The child delivers its prompt as its own first user-turn and
/// overwrites the provisional registry row once it knows its PID.
pub async fn spawn_subagent(paths: &AlephPaths, spec: &SpawnSpec) -> Result<String, SpawnError> {
    if spec.depth > MAX_DEPTH {
        return Err(SpawnError::DepthExceeded {
            requested: spec.depth,
            max: MAX_DEPTH,
        });
    }

    let agent_id = spec
        .agent_id
        .clone()
        .unwrap_or_else(generate_agent_id);

    let exe = std::env::current_exe()?;
    let mut harness_cmd: Vec<String> = vec![
        exe.to_string_lossy().into_owned(),
        "--id".to_owned(),
        agent_id.clone(),
        "--parent".to_owned(),
        spec.parent_id.clone(),
        "--depth".to_owned(),
        spec.depth.to_string(),
        "--mode".to_owned(),
        spec.mode.to_string(),
        "--aleph-home".to_owned(),
        paths.aleph_home.to_string_lossy().into_owned(),
    ];
    if let Some(prompt) = spec.prompt.as_deref() {
        harness_cmd.push("--prompt".to_owned());
        harness_cmd.push(prompt.to_owned());
    }
    if let Some(project) = spec.project.as_deref() {
        harness_cmd.push("--project".to_owned());
        harness_cmd.push(project.to_string_lossy().into_owned());
    }
    if spec.ephemeral {
        harness_cmd.push("--ephemeral".to_owned());
    }

    run_tmux_window(&agent_id, &harness_cmd).await?;

    // A provisional row with pid 0: the child overwrites it on startup, and
    // the stale-GC reaps it if the window never comes up.
    let registry = Registry::new(paths.registry_dir.clone());
    let now = OffsetDateTime::now_utc();
    let record = AgentRecord::new(
        agent_id.clone(),
        0,
        Some(spec.parent_id.clone()),
        spec.depth,
        spec.project
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned()),
        spec.mode,
        spec.ephemeral,
        now,
    );
    registry.write(&record)?;

    tracing::info!(
        agent_id = %agent_id,
        parent = %spec.parent_id,
        depth = spec.depth,
        "spawned subagent"
    );
    Ok(agent_id)
}

async fn run_tmux_window(window_name: &str, harness_cmd: &[String]) -> Result<(), SpawnError> {
    let inside_tmux = std::env::var_os("TMUX").is_some();
    let have_server = tmux_has_server().await;

    let mut cmd = Command::new("tmux");
    if inside_tmux || have_server {
        cmd.args(["new-window", "-d", "-n", window_name]);
    } else {
        cmd.args(["new-session", "-d", "-s", window_name]);
    }
    cmd.args(harness_cmd);

    let output = cmd.output().await.map_err(|err| {
        SpawnError::Tmux(format!("failed to run tmux: {err}"))
    })?;
    if !output.status.success() {
        return Err(SpawnError::Tmux(
            String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        ));
    }
    Ok(())
}

async fn tmux_has_server() -> bool {
    Command::new("tmux")
        .args(["has-session"])
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// SIGTERM the agent's process. The inbox stays: ownership across restarts
/// is ambiguous, so nobody deletes another agent's mail.
pub fn kill(registry: &Registry, agent_id: &str) -> Result<(), SpawnError> {
    let Some(record) = registry.read(agent_id)? else {
        return Ok(());
    };
    if record.pid == 0 {
        return Ok(());
    }
    let pid = nix::unistd::Pid::from_raw(record.pid as i32);
    if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
        tracing::debug!(agent_id, pid = record.pid, error = %err, "kill failed");
    }
    Ok(())
}

/// Signal-0 probe used by the registry GC.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Registry scan with stale-row GC folded in.
pub fn list_alive(registry: &Registry) -> Result<Vec<AgentRecord>, RegistryError> {
    let now = OffsetDateTime::now_utc();
    let _ = registry.prune_stale(now, pid_alive)?;
    registry.list()
}
