//! The hook bus: ordered handler chains per event, serialized per agent.
//!
//! A handler may suspend (awaiting the arbiter, doing I/O); while one chain
//! runs, no other event for this agent is dispatched. A failing handler
//! aborts the remainder of its chain, keeping whatever context earlier
//! handlers produced; the agent itself never crashes from a hook error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use aleph_core::hooks::{
    aggregate, ChainOutcome, HookDecision, HookEvent, HookEventName, ToolCall,
};
use aleph_core::inbox::{InboxStore, UnreadSummary};

use crate::arbiter::Arbiter;
use crate::dispatcher::TurnTracker;

#[async_trait]
pub trait HookHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: &HookEvent) -> anyhow::Result<HookDecision>;
}

#[derive(Default)]
pub struct HookBus {
    chains: BTreeMap<HookEventName, Vec<Arc<dyn HookHandler>>>,
    gate: Mutex<()>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: HookEventName, handler: Arc<dyn HookHandler>) {
        self.chains.entry(event).or_default().push(handler);
    }

    pub async fn dispatch(&self, event: &HookEvent) -> ChainOutcome {
        let _gate = self.gate.lock().await;

        let mut decisions = Vec::new();
        if let Some(chain) = self.chains.get(&event.name()) {
            for handler in chain {
                match handler.handle(event).await {
                    Ok(decision) => decisions.push(decision),
                    Err(err) => {
                        tracing::warn!(
                            handler = handler.name(),
                            event = ?event.name(),
                            error = %err,
                            "hook handler failed; aborting chain"
                        );
                        break;
                    }
                }
            }
        }
        aggregate(&decisions)
    }
}

/// Surfaces unread mail after every tool call, and drains it at turn end by
/// refusing to let the agent stop while messages are waiting.
pub struct InboxCheckHook {
    inbox: Arc<InboxStore>,
    agent_id: String,
    turns: Arc<TurnTracker>,
}

impl InboxCheckHook {
    pub fn new(inbox: Arc<InboxStore>, agent_id: String, turns: Arc<TurnTracker>) -> Self {
        Self {
            inbox,
            agent_id,
            turns,
        }
    }

    fn format_line(message: &UnreadSummary) -> String {
        format!(
            "[Message from {}]: {} — full message at {}",
            message.from,
            message.summary,
            message.path.display()
        )
    }

    fn unread(&self) -> anyhow::Result<Vec<UnreadSummary>> {
        let listing = self.inbox.list_unread(&self.agent_id)?;
        for quarantined in &listing.quarantined {
            tracing::warn!(path = %quarantined.display(), "quarantined malformed message");
        }
        Ok(listing.messages)
    }
}

#[async_trait]
impl HookHandler for InboxCheckHook {
    fn name(&self) -> &'static str {
        "inbox-check"
    }

    async fn handle(&self, event: &HookEvent) -> anyhow::Result<HookDecision> {
        match event {
            HookEvent::PostToolUse { .. } => {
                let messages = self.unread()?;
                let ids: Vec<String> =
                    messages.iter().map(|m| m.message_id.clone()).collect();
                let fresh = self.turns.claim_unseen(&ids);
                if fresh.is_empty() {
                    return Ok(HookDecision::defer());
                }
                let lines: Vec<String> = messages
                    .iter()
                    .filter(|m| fresh.contains(&m.message_id))
                    .map(Self::format_line)
                    .collect();
                Ok(HookDecision::context(lines.join("\n")))
            }
            HookEvent::Stop => {
                let messages = self.unread()?;
                if messages.is_empty() {
                    return Ok(HookDecision::defer());
                }
                let lines: Vec<String> = messages.iter().map(Self::format_line).collect();
                Ok(HookDecision {
                    force_continue: true,
                    ..HookDecision::context(format!(
                        "Unread messages are waiting:\n{}",
                        lines.join("\n")
                    ))
                })
            }
            _ => Ok(HookDecision::defer()),
        }
    }
}

/// Marks an inbox message read when the agent Reads its file.
pub struct ReadTrackingHook {
    inbox: Arc<InboxStore>,
    agent_id: String,
    inbox_dir: PathBuf,
}

impl ReadTrackingHook {
    pub fn new(inbox: Arc<InboxStore>, agent_id: String) -> anyhow::Result<Self> {
        let inbox_dir = inbox.inbox_dir(&agent_id)?;
        Ok(Self {
            inbox,
            agent_id,
            inbox_dir,
        })
    }
}

#[async_trait]
impl HookHandler for ReadTrackingHook {
    fn name(&self) -> &'static str {
        "read-tracking"
    }

    async fn handle(&self, event: &HookEvent) -> anyhow::Result<HookDecision> {
        let HookEvent::PostToolUse {
            call: ToolCall {
                tool_name,
                arguments,
                ..
            },
            ..
        } = event
        else {
            return Ok(HookDecision::defer());
        };
        if tool_name != "Read" && tool_name != "mcp__aleph__Read" {
            return Ok(HookDecision::defer());
        }
        let Some(file_path) = arguments.get("file_path").and_then(|v| v.as_str()) else {
            return Ok(HookDecision::defer());
        };

        let path = PathBuf::from(file_path);
        if !path.starts_with(&self.inbox_dir)
            || path.extension().and_then(|e| e.to_str()) != Some("md")
        {
            return Ok(HookDecision::defer());
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            self.inbox.mark_read(&self.agent_id, stem)?;
        }
        Ok(HookDecision::defer())
    }
}

/// A nudge to fold observations back into memory, every N tool calls.
pub struct ReminderHook {
    interval: u64,
    calls: AtomicU64,
    memory_dir: PathBuf,
}

impl ReminderHook {
    pub fn new(interval: u64, memory_dir: PathBuf) -> Self {
        Self {
            interval: interval.max(1),
            calls: AtomicU64::new(0),
            memory_dir,
        }
    }
}

#[async_trait]
impl HookHandler for ReminderHook {
    fn name(&self) -> &'static str {
        "reminder"
    }

    async fn handle(&self, event: &HookEvent) -> anyhow::Result<HookDecision> {
        if !matches!(event, HookEvent::PostToolUse { .. }) {
            return Ok(HookDecision::defer());
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.interval != 0 {
            return Ok(HookDecision::defer());
        }
        Ok(HookDecision::context(format!(
            "[System reminder]: Consider updating memory with any important \
             observations from this session. Review {}.",
            self.memory_dir.display()
        )))
    }
}

/// PreToolUse gate delegating to the arbiter.
pub struct PermissionHook {
    arbiter: Arc<Arbiter>,
}

impl PermissionHook {
    pub fn new(arbiter: Arc<Arbiter>) -> Self {
        Self { arbiter }
    }
}

#[async_trait]
impl HookHandler for PermissionHook {
    fn name(&self) -> &'static str {
        "permission"
    }

    async fn handle(&self, event: &HookEvent) -> anyhow::Result<HookDecision> {
        let HookEvent::PreToolUse(call) = event else {
            return Ok(HookDecision::defer());
        };
        Ok(self.arbiter.evaluate(call).await)
    }
}
