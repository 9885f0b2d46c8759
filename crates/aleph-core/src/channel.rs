//! Named pub/sub channels over the shared filesystem.
//!
//! Membership lives in `channels/<name>/subscribers`, an append-only log of
//! subscribe/unsubscribe events; the current set is the fold. Broadcast
//! history lives in `channels/<name>/history.jsonl` for late-joiner
//! catch-up, bounded by a retention budget.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::fsio::{self, FsError, LockFile};
use crate::inbox::{Draft, InboxStore};
use crate::message::Priority;
use crate::paths::{scoped_dir, NameError};

pub const HISTORY_RETENTION: usize = 500;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Viewer processes subscribe under this prefix; they tail the history file
/// directly and must not receive inbox copies.
pub const VIEWER_PREFIX: &str = "viewer-";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel name: {0}")]
    BadName(#[from] NameError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("corrupt subscribers log at line {line}: {text:?}")]
    CorruptLog { line: usize, text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub ts: String,
    pub from: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Outcome of one fan-out. Individual delivery failures never abort the
/// remaining recipients; they are collected here instead.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

pub struct ChannelRegistry {
    channels_dir: PathBuf,
}

impl ChannelRegistry {
    pub fn new(channels_dir: PathBuf) -> Self {
        Self { channels_dir }
    }

    fn subscribers_file(&self, channel: &str) -> Result<PathBuf, ChannelError> {
        Ok(scoped_dir(&self.channels_dir, channel)?.join("subscribers"))
    }

    fn history_file(&self, channel: &str) -> Result<PathBuf, ChannelError> {
        Ok(scoped_dir(&self.channels_dir, channel)?.join("history.jsonl"))
    }

    /// Append a subscribe event under the exclusive log lock. Idempotent:
    /// an existing member appends nothing.
    pub fn subscribe(&self, agent_id: &str, channel: &str) -> Result<(), ChannelError> {
        let path = self.subscribers_file(channel)?;
        let _lock = LockFile::exclusive(&path.with_extension("lock"), LOCK_TIMEOUT)?;
        let members = fold_members(&path)?;
        if members.contains(agent_id) {
            return Ok(());
        }
        append_event(&path, "subscribe", agent_id)
    }

    /// Append an unsubscribe event; takes effect at the next fan-out read.
    pub fn unsubscribe(&self, agent_id: &str, channel: &str) -> Result<(), ChannelError> {
        let path = self.subscribers_file(channel)?;
        let _lock = LockFile::exclusive(&path.with_extension("lock"), LOCK_TIMEOUT)?;
        let members = fold_members(&path)?;
        if !members.contains(agent_id) {
            return Ok(());
        }
        append_event(&path, "unsubscribe", agent_id)
    }

    /// Current membership: the fold of the event log, read under a shared
    /// lock so a racing append is either fully seen or not at all.
    pub fn members(&self, channel: &str) -> Result<BTreeSet<String>, ChannelError> {
        let path = self.subscribers_file(channel)?;
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let _lock = LockFile::shared(&path.with_extension("lock"), LOCK_TIMEOUT)?;
        fold_members(&path)
    }

    /// Channels that currently exist on disk.
    pub fn list(&self) -> Result<Vec<String>, ChannelError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.channels_dir) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Fan a message out to every subscriber except the sender, then append
    /// it to the channel history.
    pub fn broadcast(
        &self,
        inbox: &InboxStore,
        sender: &str,
        channel: &str,
        summary: &str,
        body: &str,
        priority: Priority,
    ) -> Result<BroadcastReport, ChannelError> {
        let members = self.members(channel)?;

        let mut report = BroadcastReport::default();
        let mut message_id = None;
        for member in &members {
            if member == sender || member.starts_with(VIEWER_PREFIX) {
                report.skipped.push(member.clone());
                continue;
            }
            let draft = Draft {
                from: sender.to_owned(),
                summary: summary.to_owned(),
                body: body.to_owned(),
                priority,
                channel: Some(channel.to_owned()),
            };
            match inbox.deliver(member, &draft) {
                Ok(id) => {
                    message_id.get_or_insert(id);
                    report.delivered.push(member.clone());
                }
                Err(err) => report.failed.push((member.clone(), err.to_string())),
            }
        }

        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        self.append_history(
            channel,
            &HistoryEntry {
                ts,
                from: sender.to_owned(),
                summary: summary.to_owned(),
                body: body.to_owned(),
                priority,
                message_id,
            },
        )?;

        Ok(report)
    }

    /// Tail of the history for late joiners.
    pub fn catch_up(&self, channel: &str, limit: usize) -> Result<Vec<HistoryEntry>, ChannelError> {
        let path = self.history_file(channel)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _lock = LockFile::shared(&path.with_extension("lock"), LOCK_TIMEOUT)?;
        let text = fs::read_to_string(&path)?;
        let mut entries: Vec<HistoryEntry> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    fn append_history(&self, channel: &str, entry: &HistoryEntry) -> Result<(), ChannelError> {
        let path = self.history_file(channel)?;
        let _lock = LockFile::exclusive(&path.with_extension("lock"), LOCK_TIMEOUT)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(entry).map_err(|err| {
            ChannelError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        drop(file);

        self.compact_history(&path)?;
        Ok(())
    }

    // Rewrite the file down to the retention budget once it has grown to
    // twice the bound, amortizing the copy. Caller holds the exclusive lock.
    fn compact_history(&self, path: &PathBuf) -> Result<(), ChannelError> {
        let text = fs::read_to_string(path)?;
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= HISTORY_RETENTION * 2 {
            return Ok(());
        }
        let keep = &lines[lines.len() - HISTORY_RETENTION..];
        let mut out = String::with_capacity(text.len() / 2);
        for line in keep {
            out.push_str(line);
            out.push('\n');
        }
        fsio::atomic_write(path, out.as_bytes())?;
        Ok(())
    }
}

fn append_event(path: &PathBuf, event: &str, agent_id: &str) -> Result<(), ChannelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{event} {agent_id} {ts}")?;
    Ok(())
}

fn fold_members(path: &PathBuf) -> Result<BTreeSet<String>, ChannelError> {
    let mut members = BTreeSet::new();
    let text = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(members),
        Err(err) => return Err(err.into()),
    };
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("subscribe"), Some(agent)) => {
                members.insert(agent.to_owned());
            }
            (Some("unsubscribe"), Some(agent)) => {
                members.remove(agent);
            }
            _ => {
                return Err(ChannelError::CorruptLog {
                    line: idx + 1,
                    text: line.to_owned(),
                })
            }
        }
    }
    Ok(members)
}
