//! The agent runtime client: a `claude` subprocess speaking stream-json on
//! both pipes, with hooks wired back to this process through the agent's
//! unix socket.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context as _};
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

use aleph_core::paths::AlephPaths;
use aleph_core::stream::{InputMessage, RuntimeEvent, StreamMessage};

use crate::config::AlephConfig;
use crate::ipc::WireFrame as _;

const HOOK_TIMEOUT_SECS: u64 = 5 * 60;
const STOP_HOOK_TIMEOUT_SECS: u64 = 10;

pub struct RuntimeHandle {
    pub pid: u32,
    pub outbound_tx: mpsc::Sender<InputMessage>,
    pub events_rx: mpsc::Receiver<RuntimeEvent>,
    pub exit_rx: watch::Receiver<Option<i32>>,
    abort_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    pub async fn shutdown(mut self) {
        let _ = self.abort_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ =
                tokio::time::timeout(std::time::Duration::from_secs(3), task).await;
        }
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn render_shell_command(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The `--settings` payload wiring the runtime's hook points back at this
/// binary via the agent's socket.
pub fn hook_settings(hook_exe: &str, socket_path: &Path) -> serde_json::Value {
    let socket = socket_path.to_string_lossy();
    let wired = |event: &str, timeout: u64| {
        serde_json::json!([
            {
                "matcher": "*",
                "hooks": [
                    {
                        "type": "command",
                        "command": render_shell_command(&[
                            hook_exe,
                            "hook",
                            event,
                            "--socket-path",
                            socket.as_ref(),
                        ]),
                        "timeout": timeout,
                    }
                ]
            }
        ])
    };
    serde_json::json!({
        "hooks": {
            "PreToolUse": wired("PreToolUse", HOOK_TIMEOUT_SECS),
            "PostToolUse": wired("PostToolUse", HOOK_TIMEOUT_SECS),
            "Stop": wired("Stop", STOP_HOOK_TIMEOUT_SECS),
        }
    })
}

/// Build (but do not spawn) the runtime subprocess command.
pub fn runtime_command(
    config: &AlephConfig,
    paths: &AlephPaths,
    agent_id: &str,
    socket_path: &Path,
    system_prompt: &str,
) -> anyhow::Result<Command> {
    let hook_exe = std::env::current_exe()
        .context("resolve current executable")?
        .to_string_lossy()
        .into_owned();
    let settings =
        serde_json::to_string(&hook_settings(&hook_exe, socket_path))
            .context("serialize runtime settings")?;

    let mut cmd = Command::new("claude");
    cmd.args([
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--permission-mode",
        "bypassPermissions",
        "--settings",
        &settings,
    ]);
    if !system_prompt.is_empty() {
        cmd.args(["--append-system-prompt", system_prompt]);
    }
    if let Some(model) = config.model.as_deref() {
        cmd.args(["--model", model]);
    }
    if config.continue_session {
        cmd.arg("--continue");
    }

    // The runtime's own memory layer stays off; Aleph's memory files are
    // the single source of continuity.
    cmd.env("CLAUDE_CODE_DISABLE_AUTO_MEMORY", "1")
        .env("CLAUDE_CODE_DISABLE_FILE_CHECKPOINTING", "1")
        .env("ALEPH_HOME", &paths.aleph_home)
        .env("ALEPH_AGENT_ID", agent_id)
        .env("ALEPH_DEPTH", config.depth.to_string());

    if paths.venv_dir.exists() {
        let venv_bin = paths.venv_dir.join("bin");
        let path = std::env::var("PATH").unwrap_or_default();
        cmd.env("VIRTUAL_ENV", &paths.venv_dir)
            .env("PATH", format!("{}:{path}", venv_bin.display()));
    }

    let cwd = config.working_dir();
    cmd.current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    Ok(cmd)
}

pub async fn spawn_runtime(
    config: &AlephConfig,
    paths: &AlephPaths,
    agent_id: &str,
    socket_path: &Path,
    system_prompt: &str,
) -> anyhow::Result<RuntimeHandle> {
    let mut cmd = runtime_command(config, paths, agent_id, socket_path, system_prompt)?;
    let mut child = cmd.spawn().context("spawn agent runtime")?;

    let pid = child.id().ok_or_else(|| anyhow!("runtime pid missing"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("runtime stdin missing"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("runtime stdout missing"))?;

    let (outbound_tx, outbound_rx) = mpsc::channel::<InputMessage>(32);
    let (events_tx, events_rx) = mpsc::channel::<RuntimeEvent>(256);
    let (abort_tx, abort_rx) = watch::channel(false);
    let (exit_tx, exit_rx) = watch::channel(None);

    let tasks = vec![
        tokio::spawn(stdin_writer(outbound_rx, stdin, abort_rx.clone())),
        tokio::spawn(stdout_reader(events_tx, stdout, abort_rx.clone())),
        tokio::spawn(reaper(child, exit_tx, abort_rx)),
    ];

    Ok(RuntimeHandle {
        pid,
        outbound_tx,
        events_rx,
        exit_rx,
        abort_tx,
        tasks,
    })
}

async fn stdin_writer(
    mut rx: mpsc::Receiver<InputMessage>,
    stdin: ChildStdin,
    mut abort_rx: watch::Receiver<bool>,
) {
    let mut writer = BufWriter::new(stdin);
    loop {
        tokio::select! {
            _ = abort_rx.changed() => {
                if *abort_rx.borrow() {
                    break;
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if msg.send(&mut writer).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn stdout_reader(
    events_tx: mpsc::Sender<RuntimeEvent>,
    stdout: ChildStdout,
    mut abort_rx: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        tokio::select! {
            _ = abort_rx.changed() => {
                if *abort_rx.borrow() {
                    break;
                }
            }
            msg = StreamMessage::receive(&mut reader) => {
                match msg {
                    Ok(Some(stream_msg)) => {
                        for event in stream_msg.to_events() {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(error = %err, "unparseable runtime output line");
                    }
                }
            }
        }
    }
}

async fn reaper(
    mut child: Child,
    exit_tx: watch::Sender<Option<i32>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = abort_rx.changed() => {
            if *abort_rx.borrow() {
                let _ = child.start_kill();
            }
            child.wait().await.ok()
        }
    };
    let _ = exit_tx.send(Some(status.and_then(|s| s.code()).unwrap_or(-1)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn shell_quote_passes_safe_args_and_wraps_the_rest() {
        assert_eq!(shell_quote("/usr/bin/aleph"), "/usr/bin/aleph");
        assert_eq!(shell_quote("hook"), "hook");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn hook_settings_wire_all_three_events() {
        let settings = hook_settings("/bin/aleph", &PathBuf::from("/tmp/a.sock"));
        for event in ["PreToolUse", "PostToolUse", "Stop"] {
            let chain = &settings["hooks"][event];
            assert!(chain.is_array(), "missing {event}");
            let command = chain[0]["hooks"][0]["command"].as_str().unwrap();
            assert!(command.contains("hook"), "{command}");
            assert!(command.contains(event), "{command}");
            assert!(command.contains("/tmp/a.sock"), "{command}");
        }
        // The Stop hook stays snappy; the gates may wait on a human.
        assert_eq!(
            settings["hooks"]["Stop"][0]["hooks"][0]["timeout"],
            serde_json::json!(STOP_HOOK_TIMEOUT_SECS)
        );
    }
}
