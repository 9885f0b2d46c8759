//! Permission policy: tool classification, mode gating, and guardrails for
//! dangerous shell commands.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Safe,
    #[default]
    Default,
    Yolo,
}

impl PermissionMode {
    pub fn next(self) -> Self {
        match self {
            PermissionMode::Safe => PermissionMode::Default,
            PermissionMode::Default => PermissionMode::Yolo,
            PermissionMode::Yolo => PermissionMode::Safe,
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionMode::Safe => "safe",
            PermissionMode::Default => "default",
            PermissionMode::Yolo => "yolo",
        };
        f.write_str(s)
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(PermissionMode::Safe),
            "default" => Ok(PermissionMode::Default),
            "yolo" => Ok(PermissionMode::Yolo),
            other => Err(format!("unknown permission mode: {other:?}")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolClass {
    Read,
    Edit,
    Bash,
    Web,
    Other,
}

/// Tool-name -> class registry. New tools register entries; unknown names
/// fall through to `Other`.
#[derive(Debug, Clone)]
pub struct ToolClassifier {
    map: BTreeMap<String, ToolClass>,
}

impl Default for ToolClassifier {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for name in ["Read", "Glob", "Grep", "NotebookRead"] {
            map.insert(name.to_owned(), ToolClass::Read);
        }
        for name in ["Edit", "Write", "MultiEdit", "NotebookEdit"] {
            map.insert(name.to_owned(), ToolClass::Edit);
        }
        for name in ["Bash", "mcp__aleph__Bash"] {
            map.insert(name.to_owned(), ToolClass::Bash);
        }
        for name in ["WebFetch", "WebSearch"] {
            map.insert(name.to_owned(), ToolClass::Web);
        }
        Self { map }
    }
}

impl ToolClassifier {
    pub fn classify(&self, tool_name: &str) -> ToolClass {
        self.map
            .get(tool_name)
            .copied()
            .unwrap_or(ToolClass::Other)
    }

    pub fn register(&mut self, tool_name: impl Into<String>, class: ToolClass) {
        self.map.insert(tool_name.into(), class);
    }
}

/// Whether this class of tool needs interactive approval under the mode.
pub fn needs_permission(mode: PermissionMode, class: ToolClass) -> bool {
    match mode {
        PermissionMode::Yolo => false,
        PermissionMode::Safe => matches!(
            class,
            ToolClass::Edit | ToolClass::Bash | ToolClass::Web
        ),
        PermissionMode::Default => matches!(class, ToolClass::Edit | ToolClass::Web),
    }
}

/// The primary argument of a tool call, used for display and guardrails.
pub fn primary_field(tool_name: &str, tool_input: &Value) -> String {
    let Some(input) = tool_input.as_object() else {
        return String::new();
    };
    match tool_name {
        "Bash" | "mcp__aleph__Bash" => input.get("command").and_then(Value::as_str).unwrap_or(""),
        "Read" | "Write" | "Edit" | "MultiEdit" => {
            input.get("file_path").and_then(Value::as_str).unwrap_or("")
        }
        "Glob" | "Grep" => input.get("pattern").and_then(Value::as_str).unwrap_or(""),
        "WebFetch" => input.get("url").and_then(Value::as_str).unwrap_or(""),
        "WebSearch" => input.get("query").and_then(Value::as_str).unwrap_or(""),
        _ => "",
    }
    .to_owned()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuardrailTier {
    /// Never allowed, in any mode.
    Block,
    /// Always prompts, even in yolo mode.
    Confirm,
}

struct Guardrail {
    pattern: Regex,
    tier: GuardrailTier,
    description: &'static str,
}

fn guardrails() -> &'static [Guardrail] {
    static RULES: OnceLock<Vec<Guardrail>> = OnceLock::new();
    RULES.get_or_init(|| {
        let raw: &[(&str, GuardrailTier, &str)] = &[
            (
                r"\brm\s+-\S*r\S*\s+/\s*$",
                GuardrailTier::Block,
                "recursive delete from filesystem root",
            ),
            (
                r"\brm\s+-\S*r\S*\s+/\*",
                GuardrailTier::Block,
                "recursive delete from filesystem root",
            ),
            (
                r"\brm\s+-\S*r\S*\s+~/?\s*$",
                GuardrailTier::Block,
                "recursive delete of home directory",
            ),
            (r"\bmkfs\b", GuardrailTier::Block, "format filesystem"),
            (
                r"\bdd\b.*\bof\s*=\s*/dev/",
                GuardrailTier::Block,
                "write directly to raw device",
            ),
            (r"\bgit\s+push\b", GuardrailTier::Confirm, "git push"),
            (
                r"\bgit\s+reset\s+--hard\b",
                GuardrailTier::Confirm,
                "git reset --hard (discards changes)",
            ),
            (
                r"\bgit\s+clean\b.*-\w*f",
                GuardrailTier::Confirm,
                "git clean (deletes untracked files)",
            ),
            (
                r"\btmux\s+kill-(session|server)\b",
                GuardrailTier::Confirm,
                "kill tmux session/server",
            ),
            (
                r"\bkillall\s",
                GuardrailTier::Confirm,
                "kill processes by name (killall)",
            ),
            (
                r"\bpkill\s",
                GuardrailTier::Confirm,
                "kill processes by pattern (pkill)",
            ),
        ];
        raw.iter()
            .filter_map(|(pattern, tier, description)| {
                Regex::new(pattern).ok().map(|pattern| Guardrail {
                    pattern,
                    tier: *tier,
                    description,
                })
            })
            .collect()
    })
}

fn has_rm_rf(command: &str) -> bool {
    static RM: OnceLock<(Regex, Regex, Regex, Regex)> = OnceLock::new();
    let (any_rm, single_group, after_rm, flag) = RM.get_or_init(|| {
        (
            Regex::new(r"\brm\s").expect("static pattern"),
            Regex::new(r"\brm\s+.*-\w*(?:r\w*f|f\w*r)").expect("static pattern"),
            Regex::new(r"\brm\s(.*)").expect("static pattern"),
            Regex::new(r"-(\w+)").expect("static pattern"),
        )
    });

    if !any_rm.is_match(command) {
        return false;
    }
    if single_group.is_match(command) {
        return true;
    }
    // Separate flag groups: rm -r somepath -f
    if let Some(caps) = after_rm.captures(command) {
        let rest = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut all_flags = String::new();
        for caps in flag.captures_iter(rest) {
            if let Some(group) = caps.get(1) {
                all_flags.push_str(group.as_str());
            }
        }
        return all_flags.contains('r') && all_flags.contains('f');
    }
    false
}

/// Tier and description for a dangerous bash command, or `None` when the
/// command is not flagged. Block rules win over confirm rules.
pub fn classify_danger(command: &str) -> Option<(GuardrailTier, &'static str)> {
    for rule in guardrails() {
        if rule.tier == GuardrailTier::Block && rule.pattern.is_match(command) {
            return Some((GuardrailTier::Block, rule.description));
        }
    }
    if has_rm_rf(command) {
        return Some((GuardrailTier::Confirm, "recursive force delete (rm -rf)"));
    }
    for rule in guardrails() {
        if rule.tier == GuardrailTier::Confirm && rule.pattern.is_match(command) {
            return Some((GuardrailTier::Confirm, rule.description));
        }
    }
    None
}
