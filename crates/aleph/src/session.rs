//! Session lifecycle: system-prompt assembly, handoff consumption, tool
//! discovery, session summaries, and the end-of-session memory commit.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use aleph_core::agent::AgentRecord;
use aleph_core::fsio;
use aleph_core::paths::AlephPaths;

use crate::config::AlephConfig;

pub const TOOL_DESCRIPTIONS_MARKER: &str = "{{TOOL_DESCRIPTIONS}}";

const RECAP_MAX_SESSIONS: usize = 3;
const RECAP_MAX_LINES: usize = 60;

/// A user tool script declared by a `# ---` comment header.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: String,
}

/// Scan `tools/` for scripts carrying a YAML header between `# ---` lines.
pub fn discover_tools(tools_dir: &Path) -> Vec<ToolSpec> {
    let mut tools = Vec::new();
    let Ok(entries) = fs::read_dir(tools_dir) else {
        return tools;
    };
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    for path in paths {
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true)
        {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        if let Some(spec) = parse_tool_header(&text) {
            tools.push(spec);
        }
    }
    tools
}

fn parse_tool_header(text: &str) -> Option<ToolSpec> {
    let mut in_header = false;
    let mut header_lines = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        if stripped == "# ---" {
            if in_header {
                break;
            }
            in_header = true;
            continue;
        }
        if in_header {
            match stripped.strip_prefix("# ") {
                Some(rest) => header_lines.push(rest),
                // A bare non-comment line inside the header: malformed.
                None => break,
            }
        }
    }
    if header_lines.is_empty() {
        return None;
    }
    serde_yaml::from_str(&header_lines.join("\n")).ok()
}

fn render_tool_descriptions(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return "(no custom tools installed)".to_owned();
    }
    let mut out = String::new();
    for tool in tools {
        let args = if tool.arguments.is_empty() {
            String::new()
        } else {
            format!(" `{}`", tool.arguments)
        };
        out.push_str(&format!("- **{}**{args} — {}\n", tool.name, tool.description));
    }
    out
}

/// Consume `memory/handoff.md`: read it, delete it, return the content.
/// Single-writer single-reader by contract; the delete is what hands the
/// baton over.
pub fn consume_handoff(paths: &AlephPaths) -> Option<String> {
    let content = fs::read_to_string(&paths.handoff_file).ok()?;
    if let Err(err) = fs::remove_file(&paths.handoff_file) {
        tracing::warn!(error = %err, "failed to delete consumed handoff");
    }
    Some(content)
}

/// Today's session summaries, newest last, bounded per file.
pub fn build_session_recap(paths: &AlephPaths, now: OffsetDateTime) -> Option<String> {
    let today = format_date(now);
    let entries = fs::read_dir(&paths.sessions_dir).ok()?;

    let mut todays: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&today) && n.ends_with(".md"))
                .unwrap_or(false)
        })
        .collect();
    todays.sort();
    if todays.is_empty() {
        return None;
    }
    let skip = todays.len().saturating_sub(RECAP_MAX_SESSIONS);

    let mut recap = String::new();
    for path in todays.into_iter().skip(skip) {
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        recap.push_str(&format!("### {name}\n\n"));
        for line in text.lines().take(RECAP_MAX_LINES) {
            recap.push_str(line);
            recap.push('\n');
        }
        recap.push('\n');
    }
    if recap.is_empty() {
        None
    } else {
        Some(recap)
    }
}

/// The system prompt: `ALEPH.md` with the tool marker substituted, then the
/// session context, memory context, and continuity sections.
pub fn build_system_prompt(
    paths: &AlephPaths,
    config: &AlephConfig,
    agent_id: &str,
    now: OffsetDateTime,
) -> String {
    let base = fs::read_to_string(&paths.system_prompt_file).unwrap_or_default();
    let tools = discover_tools(&paths.tools_dir);
    let mut prompt = base.replace(TOOL_DESCRIPTIONS_MARKER, &render_tool_descriptions(&tools));

    prompt.push_str("\n\n---\n## Session Context\n\n");
    prompt.push_str(&format!("Agent ID: {agent_id}\n"));
    if let Ok(inbox) = paths.agent_inbox(agent_id) {
        prompt.push_str(&format!("Inbox: {}\n", inbox.display()));
    }
    if let Some(parent) = config.parent.as_deref() {
        prompt.push_str(&format!("Parent: {parent}\n"));
        prompt.push_str(&format!("Depth: {}\n", config.depth));
    }
    prompt.push_str(&format!("Permission mode: {}\n", config.mode));
    prompt.push_str(&format!(
        "Working directory: {}\n",
        config.working_dir().display()
    ));
    prompt.push_str(&format!("Today's date is {}.\n", format_date(now)));

    if let Ok(context) = fs::read_to_string(&paths.context_file) {
        prompt.push_str("\n---\n## Memory Context\n\n");
        prompt.push_str(&context);
    }

    // Handoff consumption is destructive; resumed and ephemeral sessions
    // must leave the file for a future fresh session.
    let is_resuming = config.continue_session;
    let mut handoff = None;
    let mut recap = None;
    if !config.ephemeral && !is_resuming {
        handoff = consume_handoff(paths);
        recap = build_session_recap(paths, now);
    }
    if handoff.is_some() || recap.is_some() {
        prompt.push_str("\n---\n## Session Continuity\n\n");
        prompt.push_str(
            "Context carried forward from previous sessions. Use it to \
             orient yourself: what was recently worked on, what state \
             things are in, and anything left unfinished.\n\n",
        );
        if let Some(handoff) = handoff {
            prompt.push_str("### Handoff\n\n");
            prompt.push_str(&handoff);
            prompt.push_str("\n\n");
        }
        if let Some(recap) = recap {
            prompt.push_str("### Recent Sessions (today)\n\n");
            prompt.push_str(&recap);
        }
    }

    prompt
}

/// The synthetic user-turn asking for a session summary.
pub fn summary_prompt(paths: &AlephPaths, agent_id: &str, now: OffsetDateTime) -> String {
    let today = format_date(now);
    let timestamp = now.format(&Rfc3339).unwrap_or_default();
    let summary_path = paths.sessions_dir.join(format!("{today}-{agent_id}.md"));
    let memory = paths.memory_dir.display();

    format!(
        "[Session ending] Before writing the session summary, reflect on \
         what you learned this session and update your memory files.\n\n\
         ## Step 1: Memory updates\n\n\
         - **{memory}/preferences.md** — new user preferences about how \
         they like to work, communicate, or decide.\n\
         - **{memory}/patterns.md** — lessons, gotchas, things that worked \
         well, corrections you received.\n\
         - **{memory}/context.md** — durable knowledge worth always \
         knowing. Keep it under 50 lines.\n\n\
         ## Step 2: Session summary\n\n\
         Write a brief session summary to {}. Start with YAML frontmatter, \
         then the content:\n\n\
         ```\n---\nagent: {agent_id}\ntimestamp: {timestamp}\n---\n\
         # {today} — <brief title> ({agent_id})\n\n\
         ## Summary\n(1-2 sentences)\n\n\
         ## Decisions\n\n## Changes\n\n## Open threads\n```\n",
        summary_path.display()
    )
}

/// Fallback when the summary turn fails: a stub from registry metadata.
pub fn write_stub_summary(
    paths: &AlephPaths,
    record: &AgentRecord,
    now: OffsetDateTime,
) -> io::Result<()> {
    let today = format_date(now);
    let path = paths
        .sessions_dir
        .join(format!("{today}-{}.md", record.agent_id));
    let started = record.started_at.format(&Rfc3339).unwrap_or_default();
    let ended = now.format(&Rfc3339).unwrap_or_default();
    let content = format!(
        "---\nagent: {}\ntimestamp: {ended}\nstub: true\n---\n\
         # {today} — session ended without a summary ({})\n\n\
         Started {started}, ended {ended}. The summary turn did not \
         complete; this stub was written from registry metadata.\n",
        record.agent_id, record.agent_id
    );
    fsio::atomic_write(&path, content.as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

/// Leave an emergency handoff when the runtime dies under us.
pub fn write_emergency_handoff(
    paths: &AlephPaths,
    agent_id: &str,
    reason: &str,
    now: OffsetDateTime,
) -> io::Result<()> {
    let ts = now.format(&Rfc3339).unwrap_or_default();
    let content = format!(
        "# Emergency handoff from {agent_id}\n\n\
         At {ts} the runtime connection was lost and could not be \
         re-established ({reason}). The session ended abruptly; recent work \
         may be uncommitted and unread mail may be waiting in the inbox.\n"
    );
    fsio::atomic_write(&paths.handoff_file, content.as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

/// Commit any changed state under the Aleph home to its local repository.
/// Retries with exponential backoff on `index.lock` contention from sibling
/// agents; never pushes.
pub async fn commit_memory(home: &Path, agent_id: &str) -> anyhow::Result<Option<String>> {
    if !home.join(".git").exists() {
        return Ok(None);
    }

    const MAX_RETRIES: u32 = 5;
    for attempt in 0..MAX_RETRIES {
        match try_commit(home, agent_id).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt + 1 < MAX_RETRIES => {
                tracing::debug!(error = %err, attempt, "memory commit retry");
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

async fn try_commit(home: &Path, agent_id: &str) -> anyhow::Result<Option<String>> {
    let add = tokio::process::Command::new("git")
        .arg("-C")
        .arg(home)
        .args(["add", "-A"])
        .output()
        .await
        .context("spawn git add")?;
    if !add.status.success() {
        anyhow::bail!("git add failed: {}", String::from_utf8_lossy(&add.stderr));
    }

    let staged = tokio::process::Command::new("git")
        .arg("-C")
        .arg(home)
        .args(["diff", "--cached", "--quiet"])
        .output()
        .await
        .context("spawn git diff")?;
    if staged.status.success() {
        return Ok(None);
    }

    let message = format!("Session end: {agent_id}");
    let commit = tokio::process::Command::new("git")
        .arg("-C")
        .arg(home)
        .args(["commit", "-m", &message])
        .output()
        .await
        .context("spawn git commit")?;
    if !commit.status.success() {
        if home.join(".git/index.lock").exists() {
            anyhow::bail!("index.lock contention");
        }
        anyhow::bail!(
            "git commit failed: {}",
            String::from_utf8_lossy(&commit.stderr)
        );
    }

    let summary = String::from_utf8_lossy(&commit.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_owned();
    Ok(Some(summary))
}

fn format_date(now: OffsetDateTime) -> String {
    now.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default()
}
