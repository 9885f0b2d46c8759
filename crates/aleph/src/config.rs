//! Session configuration assembled from CLI flags and environment.

use std::path::PathBuf;

use aleph_core::ids::generate_agent_id;
use aleph_core::permissions::PermissionMode;

#[derive(Debug, Clone, Default)]
pub struct AlephConfig {
    pub agent_id: Option<String>,
    pub project: Option<PathBuf>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub parent: Option<String>,
    pub depth: u32,
    pub mode: PermissionMode,
    pub ephemeral: bool,
    pub detach: bool,
    pub continue_session: bool,
}

impl AlephConfig {
    pub fn resolve_agent_id(&self) -> String {
        self.agent_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(generate_agent_id)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.project
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_agent_id_wins() {
        let config = AlephConfig {
            agent_id: Some("aleph-feedbeef".to_owned()),
            ..Default::default()
        };
        assert_eq!(config.resolve_agent_id(), "aleph-feedbeef");
    }

    #[test]
    fn blank_agent_id_is_generated() {
        let config = AlephConfig {
            agent_id: Some("   ".to_owned()),
            ..Default::default()
        };
        assert!(config.resolve_agent_id().starts_with("aleph-"));
    }

    #[test]
    fn project_sets_working_dir() {
        let config = AlephConfig {
            project: Some(PathBuf::from("/work/demo")),
            ..Default::default()
        };
        assert_eq!(config.working_dir(), PathBuf::from("/work/demo"));
    }
}
