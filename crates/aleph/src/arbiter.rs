//! The permission arbiter: classifies a tool call, synthesizes a preview,
//! suspends the hook chain on a single pending slot, and resumes with the
//! UI's verdict.

use std::fs;
use std::path::Path;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use aleph_core::diff;
use aleph_core::hooks::{HookDecision, ToolCall};
use aleph_core::permissions::{
    self, classify_danger, needs_permission, GuardrailTier, PermissionMode, ToolClass,
    ToolClassifier,
};

use crate::ui::{PermissionPromptView, UiBridge, UiEvent};

pub const DENY_PREFIX: &str = "Tool denied by permission policy";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution {
    Allowed,
    Denied,
    Interrupted,
}

#[derive(Debug)]
pub struct PermissionRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub classification: ToolClass,
    pub diff: Option<String>,
}

struct PendingPermission {
    id: String,
    respond_tx: oneshot::Sender<Resolution>,
}

pub struct Arbiter {
    mode: StdMutex<PermissionMode>,
    classifier: ToolClassifier,
    // One slot: the hook bus serialises PreToolUse per agent, so a second
    // pending request is a bug upstream and denies immediately.
    pending: Mutex<Option<PendingPermission>>,
    ui: UiBridge,
}

fn request_id() -> String {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_ok() {
        let mut out = String::with_capacity(13);
        out.push_str("perm-");
        for b in buf {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{b:02x}");
        }
        return out;
    }
    format!("perm-{}", std::process::id())
}

impl Arbiter {
    pub fn new(mode: PermissionMode, ui: UiBridge) -> Self {
        Self {
            mode: StdMutex::new(mode),
            classifier: ToolClassifier::default(),
            pending: Mutex::new(None),
            ui,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        match self.mode.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn cycle_mode(&self) -> PermissionMode {
        let mut guard = match self.mode.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = guard.next();
        *guard
    }

    /// Gate one PreToolUse event. Returns the decision the hook chain will
    /// fold in; denials carry the operator-visible reason.
    pub async fn evaluate(&self, call: &ToolCall) -> HookDecision {
        let class = self.classifier.classify(&call.tool_name);
        let mode = self.mode();

        // Guardrails outrank the mode, yolo included.
        if class == ToolClass::Bash {
            let command = call
                .arguments
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or("");
            match classify_danger(command) {
                Some((GuardrailTier::Block, reason)) => {
                    return HookDecision::deny(format!(
                        "{DENY_PREFIX}: blocked by guardrail: {reason}. This command is never allowed."
                    ));
                }
                Some((GuardrailTier::Confirm, reason)) => {
                    let preview = format!("DANGEROUS: {reason}\n\n$ {command}");
                    return self
                        .prompt(call, class, Some(preview), &format!(
                            "user rejected dangerous command: {reason}"
                        ))
                        .await;
                }
                None => {}
            }
        }

        if !needs_permission(mode, class) {
            return HookDecision::allow();
        }

        let preview = self.synthesize_preview(call, class);
        self.prompt(call, class, preview, "user rejected").await
    }

    async fn prompt(
        &self,
        call: &ToolCall,
        classification: ToolClass,
        diff: Option<String>,
        deny_reason: &str,
    ) -> HookDecision {
        let request = PermissionRequest {
            id: request_id(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            classification,
            diff,
        };

        let (respond_tx, respond_rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().await;
            if slot.is_some() {
                return HookDecision::deny(format!(
                    "{DENY_PREFIX}: another permission request is already pending"
                ));
            }
            *slot = Some(PendingPermission {
                id: request.id.clone(),
                respond_tx,
            });
        }

        self.ui.send(UiEvent::PermissionPrompt(PermissionPromptView {
            id: request.id.clone(),
            tool_name: request.tool_name.clone(),
            classification,
            diff: request.diff.clone(),
        }));

        let resolution = respond_rx.await.unwrap_or(Resolution::Interrupted);
        match resolution {
            Resolution::Allowed => HookDecision::allow(),
            Resolution::Denied => HookDecision::deny(format!("{DENY_PREFIX}: {deny_reason}")),
            Resolution::Interrupted => {
                HookDecision::deny(format!("{DENY_PREFIX}: interrupted"))
            }
        }
    }

    /// Resolve the pending request from the UI. Returns false when no
    /// request with that id is waiting.
    pub async fn resolve(&self, id: &str, allow: bool) -> bool {
        let mut slot = self.pending.lock().await;
        match slot.take() {
            Some(pending) if pending.id == id => {
                let resolution = if allow {
                    Resolution::Allowed
                } else {
                    Resolution::Denied
                };
                let _ = pending.respond_tx.send(resolution);
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    /// Resolve whatever prompt is showing. The console UI has exactly one.
    pub async fn resolve_current(&self, allow: bool) -> bool {
        let id = {
            let slot = self.pending.lock().await;
            slot.as_ref().map(|p| p.id.clone())
        };
        match id {
            Some(id) => self.resolve(&id, allow).await,
            None => false,
        }
    }

    /// Turn interruption: a pending request auto-denies.
    pub async fn interrupt(&self) {
        let mut slot = self.pending.lock().await;
        if let Some(pending) = slot.take() {
            let _ = pending.respond_tx.send(Resolution::Interrupted);
        }
    }

    pub async fn has_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    fn synthesize_preview(&self, call: &ToolCall, class: ToolClass) -> Option<String> {
        match class {
            ToolClass::Edit => Some(edit_preview(&call.tool_name, &call.arguments)),
            ToolClass::Bash => {
                let command = call
                    .arguments
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let description = call
                    .arguments
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Some(diff::bash_preview(command, description))
            }
            ToolClass::Web => {
                let target = permissions::primary_field(&call.tool_name, &call.arguments);
                (!target.is_empty()).then_some(target)
            }
            _ => None,
        }
    }
}

/// Unified diff of the proposed change against what is on disk now.
fn edit_preview(tool_name: &str, arguments: &Value) -> String {
    let path = arguments
        .get("file_path")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    match tool_name {
        "Edit" => {
            let old_string = arguments
                .get("old_string")
                .and_then(Value::as_str)
                .unwrap_or("");
            let new_string = arguments
                .get("new_string")
                .and_then(Value::as_str)
                .unwrap_or("");
            match fs::read_to_string(Path::new(path)) {
                Ok(current) => {
                    let proposed = current.replacen(old_string, new_string, 1);
                    diff::unified_diff(&current, &proposed, path)
                }
                // Target unreadable: fall back to diffing the fragments.
                Err(_) => diff::unified_diff(old_string, new_string, path),
            }
        }
        _ => {
            let content = arguments
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("");
            match fs::read_to_string(Path::new(path)) {
                Ok(current) => diff::unified_diff(&current, content, path),
                Err(_) => diff::new_file_preview(content),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::UiBridge;
    use std::sync::Arc;

    fn call(tool_name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            tool_name: tool_name.to_owned(),
            arguments,
            tool_use_id: None,
        }
    }

    #[tokio::test]
    async fn yolo_allows_without_prompting() {
        let (ui, mut rx) = UiBridge::new();
        let arbiter = Arbiter::new(PermissionMode::Yolo, ui);

        let decision = arbiter
            .evaluate(&call("Edit", serde_json::json!({"file_path": "/tmp/x"})))
            .await;
        assert_eq!(decision, HookDecision::allow());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_is_free_in_safe_mode() {
        let (ui, _rx) = UiBridge::new();
        let arbiter = Arbiter::new(PermissionMode::Safe, ui);
        let decision = arbiter
            .evaluate(&call("Read", serde_json::json!({"file_path": "/etc/hosts"})))
            .await;
        assert_eq!(decision, HookDecision::allow());
    }

    #[tokio::test]
    async fn denial_carries_policy_reason() {
        let (ui, mut rx) = UiBridge::new();
        let arbiter = Arc::new(Arbiter::new(PermissionMode::Safe, ui));

        let evaluating = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .evaluate(&call("Bash", serde_json::json!({"command": "cargo build"})))
                    .await
            })
        };

        // Wait for the prompt, then press "n".
        let prompt = loop {
            match rx.recv().await.unwrap() {
                UiEvent::PermissionPrompt(view) => break view,
                _ => continue,
            }
        };
        assert_eq!(prompt.tool_name, "Bash");
        assert!(arbiter.resolve(&prompt.id, false).await);

        let decision = evaluating.await.unwrap();
        assert_eq!(decision.permission, aleph_core::hooks::PermissionDecision::Deny);
        let reason = decision.message.unwrap();
        assert!(reason.starts_with(DENY_PREFIX), "got: {reason}");
        assert!(reason.contains("user rejected"));
    }

    #[tokio::test]
    async fn block_guardrail_denies_even_in_yolo() {
        let (ui, mut rx) = UiBridge::new();
        let arbiter = Arbiter::new(PermissionMode::Yolo, ui);

        let decision = arbiter
            .evaluate(&call("Bash", serde_json::json!({"command": "rm -rf /"})))
            .await;
        assert_eq!(decision.permission, aleph_core::hooks::PermissionDecision::Deny);
        assert!(decision.message.unwrap().contains("guardrail"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn confirm_guardrail_prompts_even_in_yolo() {
        let (ui, mut rx) = UiBridge::new();
        let arbiter = Arc::new(Arbiter::new(PermissionMode::Yolo, ui));

        let evaluating = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .evaluate(&call(
                        "Bash",
                        serde_json::json!({"command": "git push origin main"}),
                    ))
                    .await
            })
        };

        let prompt = loop {
            match rx.recv().await.unwrap() {
                UiEvent::PermissionPrompt(view) => break view,
                _ => continue,
            }
        };
        assert!(prompt.diff.unwrap().starts_with("DANGEROUS"));
        arbiter.resolve(&prompt.id, true).await;

        let decision = evaluating.await.unwrap();
        assert_eq!(decision, HookDecision::allow());
    }

    #[tokio::test]
    async fn interrupt_auto_denies_pending_prompt() {
        let (ui, mut rx) = UiBridge::new();
        let arbiter = Arc::new(Arbiter::new(PermissionMode::Safe, ui));

        let evaluating = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .evaluate(&call("Bash", serde_json::json!({"command": "make test"})))
                    .await
            })
        };

        loop {
            if let UiEvent::PermissionPrompt(_) = rx.recv().await.unwrap() {
                break;
            }
        }
        arbiter.interrupt().await;

        let decision = evaluating.await.unwrap();
        assert!(decision.message.unwrap().contains("interrupted"));
        assert!(!arbiter.has_pending().await);
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_ids() {
        let (ui, _rx) = UiBridge::new();
        let arbiter = Arbiter::new(PermissionMode::Safe, ui);
        assert!(!arbiter.resolve("perm-unknown", true).await);
    }

    #[tokio::test]
    async fn edit_preview_diffs_against_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let (ui, mut rx) = UiBridge::new();
        let arbiter = Arc::new(Arbiter::new(PermissionMode::Default, ui));

        let args = serde_json::json!({
            "file_path": path.to_string_lossy(),
            "old_string": "two",
            "new_string": "2",
        });
        let evaluating = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.evaluate(&call("Edit", args)).await })
        };

        let prompt = loop {
            match rx.recv().await.unwrap() {
                UiEvent::PermissionPrompt(view) => break view,
                _ => continue,
            }
        };
        let diff = prompt.diff.unwrap();
        assert!(diff.contains("-two"), "got diff:\n{diff}");
        assert!(diff.contains("+2"));

        arbiter.resolve(&prompt.id, true).await;
        evaluating.await.unwrap();
    }

    #[test]
    fn mode_cycle_round_trips() {
        let (ui, _rx) = UiBridge::new();
        let arbiter = Arbiter::new(PermissionMode::Safe, ui);
        assert_eq!(arbiter.cycle_mode(), PermissionMode::Default);
        assert_eq!(arbiter.cycle_mode(), PermissionMode::Yolo);
        assert_eq!(arbiter.cycle_mode(), PermissionMode::Safe);
        assert_eq!(arbiter.mode(), PermissionMode::Safe);
    }
}
