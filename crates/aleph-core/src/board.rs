//! The shared task board: a per-project YAML file mutated by many agents
//! under one exclusive lock, with atomic write-back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::fsio::{self, FsError, LockFile};

const BOARD_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Open,
    Claimed,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task {task_id} already claimed by {holder}")]
    AlreadyClaimed { task_id: String, holder: String },
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task_id} is assigned to {assignee:?}, not {agent_id}")]
    NotAssignee {
        task_id: String,
        assignee: Option<String>,
        agent_id: String,
    },
    #[error("invalid task board: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The permitted status graph. `claimed -> open` is the release path.
pub fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Open, Claimed)
            | (Claimed, InProgress)
            | (Claimed, Open)
            | (InProgress, Done)
            | (InProgress, Blocked)
            | (Blocked, InProgress)
    )
}

fn find_task_mut<'a>(tasks: &'a mut [Task], id: &str) -> Option<&'a mut Task> {
    for task in tasks {
        if task.id == id {
            return Some(task);
        }
        if let Some(found) = find_task_mut(&mut task.subtasks, id) {
            return Some(found);
        }
    }
    None
}

fn find_task<'a>(tasks: &'a [Task], id: &str) -> Option<&'a Task> {
    for task in tasks {
        if task.id == id {
            return Some(task);
        }
        if let Some(found) = find_task(&task.subtasks, id) {
            return Some(found);
        }
    }
    None
}

pub struct TaskBoard {
    path: PathBuf,
}

impl TaskBoard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "board".to_owned());
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{name}.lock"))
    }

    /// Snapshot read. Writers are atomic, so no lock is needed here.
    pub fn load(&self) -> Result<TaskFile, BoardError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(TaskFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, task_id: &str) -> Result<Task, BoardError> {
        let file = self.load()?;
        find_task(&file.tasks, task_id)
            .cloned()
            .ok_or_else(|| BoardError::NotFound(task_id.to_owned()))
    }

    /// Claim an open task. At most one concurrent claimant wins; the loser
    /// sees `AlreadyClaimed` with the winner's id.
    pub fn claim(&self, task_id: &str, agent_id: &str) -> Result<Task, BoardError> {
        self.mutate(task_id, |task| {
            match task.status {
                TaskStatus::Open => {}
                TaskStatus::Claimed | TaskStatus::InProgress => {
                    return Err(BoardError::AlreadyClaimed {
                        task_id: task.id.clone(),
                        holder: task.assignee.clone().unwrap_or_default(),
                    });
                }
                from => {
                    return Err(BoardError::InvalidTransition {
                        task_id: task.id.clone(),
                        from,
                        to: TaskStatus::Claimed,
                    });
                }
            }
            task.status = TaskStatus::Claimed;
            task.assignee = Some(agent_id.to_owned());
            Ok(())
        })
    }

    /// Move a task along the status graph. Only the assignee may advance an
    /// assigned task; `done` records the completion timestamp.
    pub fn set_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        agent_id: &str,
    ) -> Result<Task, BoardError> {
        self.mutate(task_id, |task| {
            if !transition_allowed(task.status, new_status) {
                return Err(BoardError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: new_status,
                });
            }
            if let Some(assignee) = &task.assignee {
                if assignee != agent_id {
                    return Err(BoardError::NotAssignee {
                        task_id: task.id.clone(),
                        assignee: task.assignee.clone(),
                        agent_id: agent_id.to_owned(),
                    });
                }
            }
            task.status = new_status;
            match new_status {
                TaskStatus::Done => {
                    task.completed_at = Some(
                        OffsetDateTime::now_utc()
                            .format(&Rfc3339)
                            .unwrap_or_default(),
                    );
                }
                TaskStatus::Open => {
                    task.assignee = None;
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Return a claimed task to the pool. Only the current assignee may
    /// release.
    pub fn release(&self, task_id: &str, agent_id: &str) -> Result<Task, BoardError> {
        self.mutate(task_id, |task| {
            if task.assignee.as_deref() != Some(agent_id) {
                return Err(BoardError::NotAssignee {
                    task_id: task.id.clone(),
                    assignee: task.assignee.clone(),
                    agent_id: agent_id.to_owned(),
                });
            }
            if !transition_allowed(task.status, TaskStatus::Open) {
                return Err(BoardError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: TaskStatus::Open,
                });
            }
            task.status = TaskStatus::Open;
            task.assignee = None;
            Ok(())
        })
    }

    // Locked read-modify-write. Any error leaves the file untouched.
    fn mutate<F>(&self, task_id: &str, op: F) -> Result<Task, BoardError>
    where
        F: FnOnce(&mut Task) -> Result<(), BoardError>,
    {
        let _lock = LockFile::exclusive(&self.lock_path(), BOARD_LOCK_TIMEOUT)?;

        let mut file = self.load()?;
        let task = find_task_mut(&mut file.tasks, task_id)
            .ok_or_else(|| BoardError::NotFound(task_id.to_owned()))?;
        op(task)?;
        let result = task.clone();

        let text = serde_yaml::to_string(&file)?;
        fsio::atomic_write(&self.path, text.as_bytes())?;
        Ok(result)
    }
}
