//! Agent identity and lifecycle: the registry row and its state machine.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::permissions::PermissionMode;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Idle,
    Busy,
    Interrupted,
    Terminating,
    Terminated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AgentLifecycleEvent {
    /// The runtime connected and is awaiting input.
    Ready,
    /// A user-turn began (first tool call or prompt accepted).
    TurnStarted,
    /// The runtime signalled turn completion.
    TurnCompleted,
    /// The operator interrupted a running turn.
    Interrupted,
    /// Shutdown began (summary prompt, deregistration).
    ShutdownRequested,
    /// The process is gone.
    Exited,
}

/// One row under `registry/<agent_id>.json`, exclusively owned by the
/// agent's own process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub mode: PermissionMode,
    #[serde(default)]
    pub ephemeral: bool,
    pub state: AgentState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
}

impl AgentRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        pid: u32,
        parent_id: Option<String>,
        depth: u32,
        project_path: Option<String>,
        mode: PermissionMode,
        ephemeral: bool,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            agent_id,
            pid,
            parent_id,
            depth,
            project_path,
            mode,
            ephemeral,
            state: AgentState::Starting,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Fold a lifecycle event into a new record. Unknown combinations keep
    /// the current state; the heartbeat always advances.
    pub fn apply_event(&self, event: AgentLifecycleEvent, now: OffsetDateTime) -> Self {
        use AgentLifecycleEvent::*;
        use AgentState::*;

        let mut next = self.clone();
        next.last_heartbeat = now;
        next.state = match (self.state, event) {
            (Starting, Ready) => Idle,
            (Idle, TurnStarted) | (AgentState::Interrupted, TurnStarted) => Busy,
            (Busy, TurnCompleted) => Idle,
            (Busy, AgentLifecycleEvent::Interrupted) => AgentState::Interrupted,
            (Terminated, _) => Terminated,
            (_, ShutdownRequested) => Terminating,
            (_, Exited) => Terminated,
            (state, _) => state,
        };
        next
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_heartbeat = now;
    }

    pub fn is_live_state(&self) -> bool {
        !matches!(self.state, AgentState::Terminated)
    }
}
