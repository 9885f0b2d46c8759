//! Hook events, decisions, chain aggregation, and the JSON envelope handed
//! back to the runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookEventName {
    PreToolUse,
    PostToolUse,
    SessionStart,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    PreToolUse(ToolCall),
    PostToolUse {
        call: ToolCall,
        result: String,
        is_error: bool,
    },
    SessionStart,
    Stop,
}

impl HookEvent {
    pub fn name(&self) -> HookEventName {
        match self {
            HookEvent::PreToolUse(_) => HookEventName::PreToolUse,
            HookEvent::PostToolUse { .. } => HookEventName::PostToolUse,
            HookEvent::SessionStart => HookEventName::SessionStart,
            HookEvent::Stop => HookEventName::Stop,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
    /// Transparent: the next handler (or the mode default) decides.
    #[default]
    Defer,
}

/// What one handler returned for one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookDecision {
    pub additional_context: Option<String>,
    pub permission: PermissionDecision,
    pub message: Option<String>,
    /// Stop handlers set this to push the agent into another turn.
    pub force_continue: bool,
}

impl HookDecision {
    pub fn defer() -> Self {
        Self::default()
    }

    pub fn allow() -> Self {
        Self {
            permission: PermissionDecision::Allow,
            ..Self::default()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            permission: PermissionDecision::Deny,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn context(text: impl Into<String>) -> Self {
        Self {
            additional_context: Some(text.into()),
            ..Self::default()
        }
    }
}

/// The fold of a whole handler chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainOutcome {
    pub permission: PermissionDecision,
    pub reason: Option<String>,
    pub additional_context: Option<String>,
    pub force_continue: bool,
}

/// Contexts concatenate in chain order with blank-line separation; the
/// first non-defer permission wins, later handlers contributing context and
/// side effects only.
pub fn aggregate(decisions: &[HookDecision]) -> ChainOutcome {
    let mut outcome = ChainOutcome::default();
    let mut contexts: Vec<&str> = Vec::new();

    for decision in decisions {
        if let Some(ctx) = decision.additional_context.as_deref() {
            if !ctx.is_empty() {
                contexts.push(ctx);
            }
        }
        if outcome.permission == PermissionDecision::Defer
            && decision.permission != PermissionDecision::Defer
        {
            outcome.permission = decision.permission;
            outcome.reason = decision.message.clone();
        }
        outcome.force_continue |= decision.force_continue;
    }

    if !contexts.is_empty() {
        outcome.additional_context = Some(contexts.join("\n\n"));
    }
    outcome
}

/// The wire envelope the runtime understands. An empty outcome serializes
/// to `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookOutput {
    #[serde(
        rename = "hookSpecificOutput",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hook_specific_output: Option<HookSpecificOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: HookEventName,
    #[serde(
        rename = "additionalContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_context: Option<String>,
    #[serde(
        rename = "permissionDecision",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision: Option<PermissionDecision>,
    #[serde(
        rename = "permissionDecisionReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision_reason: Option<String>,
}

impl HookOutput {
    pub fn from_outcome(event: HookEventName, outcome: &ChainOutcome) -> Self {
        let permission_decision = match outcome.permission {
            PermissionDecision::Defer => None,
            decided => Some(decided),
        };
        if permission_decision.is_none() && outcome.additional_context.is_none() {
            return Self::default();
        }
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: event,
                additional_context: outcome.additional_context.clone(),
                permission_decision,
                permission_decision_reason: outcome.reason.clone(),
            }),
        }
    }
}
