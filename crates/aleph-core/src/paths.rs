use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInputs {
    pub home_dir: PathBuf,
    pub aleph_home_override: Option<PathBuf>,
}

/// Resolved layout of the shared Aleph home directory.
///
/// Computed once at startup and threaded through every component; nothing
/// reads `ALEPH_HOME` after this point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlephPaths {
    pub aleph_home: PathBuf,

    pub system_prompt_file: PathBuf,

    pub memory_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub handoff_file: PathBuf,
    pub context_file: PathBuf,

    pub inbox_dir: PathBuf,
    pub channels_dir: PathBuf,
    pub registry_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    /// Runtime plumbing: per-agent hook sockets.
    pub harness_dir: PathBuf,
    pub venv_dir: PathBuf,
}

pub fn compute_paths(inputs: PathInputs) -> AlephPaths {
    let aleph_home = inputs
        .aleph_home_override
        .unwrap_or_else(|| inputs.home_dir.join(".aleph"));

    let memory_dir = aleph_home.join("memory");

    AlephPaths {
        system_prompt_file: aleph_home.join("ALEPH.md"),

        sessions_dir: memory_dir.join("sessions"),
        handoff_file: memory_dir.join("handoff.md"),
        context_file: memory_dir.join("context.md"),
        memory_dir,

        inbox_dir: aleph_home.join("inbox"),
        channels_dir: aleph_home.join("channels"),
        registry_dir: aleph_home.join("registry"),
        tools_dir: aleph_home.join("tools"),
        scratch_dir: aleph_home.join("scratch"),
        plans_dir: aleph_home.join("plans"),
        logs_dir: aleph_home.join("logs"),
        quarantine_dir: aleph_home.join("quarantine"),
        harness_dir: aleph_home.join("harness"),
        venv_dir: aleph_home.join("venv"),

        aleph_home,
    }
}

impl AlephPaths {
    pub fn agent_inbox(&self, agent_id: &str) -> Result<PathBuf, NameError> {
        scoped_dir(&self.inbox_dir, agent_id)
    }

    pub fn channel_dir(&self, channel: &str) -> Result<PathBuf, NameError> {
        scoped_dir(&self.channels_dir, channel)
    }

    pub fn registry_record(&self, agent_id: &str) -> Result<PathBuf, NameError> {
        Ok(scoped_dir(&self.registry_dir, agent_id)?.with_extension("json"))
    }

    pub fn hook_socket(&self, agent_id: &str) -> Result<PathBuf, NameError> {
        Ok(scoped_dir(&self.harness_dir, agent_id)?.with_extension("sock"))
    }
}

pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("not a valid agent or channel name: {name:?}")]
    Invalid { name: String },
}

/// Validate an agent id or channel name before it becomes a filename.
///
/// Ids like `aleph-1a2b3c4d`, `viewer-kira`, or a channel like
/// `exploration` name inbox directories, registry rows, subscriber log
/// entries, and hook sockets, so the charset is the intersection of what
/// all of those tolerate: ASCII alphanumerics, `-`, `_`, starting with an
/// alphanumeric. That shuts out path traversal, nested segments, dotfiles,
/// and whitespace in the subscriber log's space-separated lines.
pub fn checked_name(name: &str) -> Result<&str, NameError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(NameError::Empty);
    }

    let starts_alphanumeric = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let charset_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !starts_alphanumeric || !charset_ok || name.len() > MAX_NAME_LEN {
        return Err(NameError::Invalid {
            name: name.to_owned(),
        });
    }
    Ok(name)
}

/// A per-agent (or per-channel) directory or file stem under `base`.
pub fn scoped_dir(base: &Path, name: &str) -> Result<PathBuf, NameError> {
    Ok(base.join(checked_name(name)?))
}
