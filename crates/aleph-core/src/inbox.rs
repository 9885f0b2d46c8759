//! Per-agent mail directories under `inbox/<agent_id>/`.
//!
//! Delivery is lock-free (unique ULID filenames); only pruning takes the
//! inbox lock. Read state is a `<id>.read` sidecar so concurrent readers
//! and writers never contend on the message file itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use crate::fsio::{self, FsError, LockFile};
use crate::ids::{ulid_timestamp_ms, UlidGen};
use crate::message::{clamp_summary, Message, MessageError, MessageHeader, Priority};
use crate::paths::{scoped_dir, NameError};

const PRUNE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("invalid recipient: {0}")]
    BadRecipient(#[from] NameError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// A message ready for delivery; the store allocates the id and timestamp.
#[derive(Debug, Clone)]
pub struct Draft {
    pub from: String,
    pub summary: String,
    pub body: String,
    pub priority: Priority,
    /// Set when the message arrived via a channel broadcast.
    pub channel: Option<String>,
}

/// One unread inbox entry, as surfaced to hooks and the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadSummary {
    pub message_id: String,
    pub from: String,
    pub summary: String,
    pub priority: Priority,
    pub timestamp: OffsetDateTime,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct UnreadListing {
    pub messages: Vec<UnreadSummary>,
    /// Files that failed to parse and were moved aside.
    pub quarantined: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrunePolicy {
    pub older_than: Option<Duration>,
    pub max_count: Option<usize>,
}

pub struct InboxStore {
    root: PathBuf,
    quarantine_dir: PathBuf,
    ids: UlidGen,
}

impl InboxStore {
    pub fn new(root: PathBuf, quarantine_dir: PathBuf) -> Self {
        Self {
            root,
            quarantine_dir,
            ids: UlidGen::new(),
        }
    }

    pub fn inbox_dir(&self, recipient: &str) -> Result<PathBuf, InboxError> {
        Ok(scoped_dir(&self.root, recipient)?)
    }

    /// Write the message file atomically and return its id. No lock is
    /// taken; the unique filename is the whole concurrency story.
    pub fn deliver(&self, recipient: &str, draft: &Draft) -> Result<String, InboxError> {
        let dir = self.inbox_dir(recipient)?;
        let message_id = self.ids.next();

        let header = MessageHeader {
            from: draft.from.clone(),
            to: if draft.channel.is_none() {
                Some(recipient.to_owned())
            } else {
                None
            },
            channel: draft.channel.clone(),
            summary: clamp_summary(&draft.summary),
            priority: draft.priority,
            timestamp: OffsetDateTime::now_utc(),
            message_id: message_id.clone(),
            extra: Default::default(),
        };
        let message = Message {
            header,
            body: draft.body.clone(),
        };

        let path = dir.join(format!("{message_id}.md"));
        fsio::atomic_write(&path, message.render()?.as_bytes())?;
        Ok(message_id)
    }

    /// Unread messages sorted by priority desc, then timestamp asc, then id.
    ///
    /// Listing is eventually consistent with concurrent delivery; malformed
    /// files are quarantined rather than blocking the rest of the mail.
    pub fn list_unread(&self, recipient: &str) -> Result<UnreadListing, InboxError> {
        let dir = self.inbox_dir(recipient)?;
        let mut listing = UnreadListing::default();

        let entries = match fs::read_dir(&dir) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(listing),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if path.with_extension("read").exists() {
                continue;
            }
            match self.load_summary(&path) {
                Ok(summary) => listing.messages.push(summary),
                Err(_) => {
                    if let Ok(dest) = self.quarantine(&path) {
                        listing.quarantined.push(dest);
                    }
                }
            }
        }

        listing.messages.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(listing)
    }

    /// Idempotent: marking twice (or marking a deleted message) succeeds.
    pub fn mark_read(&self, recipient: &str, message_id: &str) -> Result<(), InboxError> {
        let dir = self.inbox_dir(recipient)?;
        fs::create_dir_all(&dir)?;
        let marker = dir.join(format!("{message_id}.read"));
        match fs::OpenOptions::new().create(true).write(true).open(&marker) {
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete read messages matching the policy. Holds the inbox lock so a
    /// concurrent prune never sees a half-deleted listing; delivery does not
    /// take this lock and may interleave freely.
    pub fn prune(&self, recipient: &str, policy: PrunePolicy) -> Result<usize, InboxError> {
        let dir = self.inbox_dir(recipient)?;
        if !dir.exists() {
            return Ok(0);
        }
        let _lock = LockFile::exclusive(&dir.join(".prune.lock"), PRUNE_LOCK_TIMEOUT)?;

        // Read messages only, oldest first by id.
        let mut read_ids: Vec<String> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if !path.with_extension("read").exists() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                read_ids.push(stem.to_owned());
            }
        }
        read_ids.sort();

        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        let mut doomed: Vec<String> = Vec::new();

        if let Some(age) = policy.older_than {
            let cutoff = now_ms.saturating_sub(age.as_millis() as u64);
            for id in &read_ids {
                match ulid_timestamp_ms(id) {
                    Some(ts) if ts < cutoff => doomed.push(id.clone()),
                    _ => {}
                }
            }
        }
        if let Some(max) = policy.max_count {
            if read_ids.len() > max {
                let overflow = read_ids.len() - max;
                for id in read_ids.iter().take(overflow) {
                    if !doomed.contains(id) {
                        doomed.push(id.clone());
                    }
                }
            }
        }

        for id in &doomed {
            let _ = fs::remove_file(dir.join(format!("{id}.md")));
            let _ = fs::remove_file(dir.join(format!("{id}.read")));
        }
        Ok(doomed.len())
    }

    fn load_summary(&self, path: &Path) -> Result<UnreadSummary, InboxError> {
        let text = fs::read_to_string(path)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();

        if text.starts_with("---") {
            let message = Message::parse(&text)?;
            return Ok(UnreadSummary {
                message_id: message.header.message_id,
                from: message.header.from,
                summary: message.header.summary,
                priority: message.header.priority,
                timestamp: message.header.timestamp,
                path: path.to_path_buf(),
            });
        }

        // No frontmatter: a hand-dropped note. First line stands in for the
        // summary; the ULID filename carries the timestamp.
        let first_line = text.lines().next().unwrap_or_default();
        let ts_ms = ulid_timestamp_ms(&stem).unwrap_or(0);
        let timestamp =
            OffsetDateTime::from_unix_timestamp_nanos(ts_ms as i128 * 1_000_000)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Ok(UnreadSummary {
            message_id: stem,
            from: "unknown".to_owned(),
            summary: clamp_summary(first_line),
            priority: Priority::Normal,
            timestamp,
            path: path.to_path_buf(),
        })
    }

    fn quarantine(&self, path: &Path) -> Result<PathBuf, InboxError> {
        fs::create_dir_all(&self.quarantine_dir)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "message.md".to_owned());
        let dest = self.quarantine_dir.join(name);
        fs::rename(path, &dest)?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> InboxStore {
        InboxStore::new(dir.path().join("inbox"), dir.path().join("quarantine"))
    }

    fn draft(summary: &str, priority: Priority) -> Draft {
        Draft {
            from: "aleph-aaaaaaaa".to_owned(),
            summary: summary.to_owned(),
            body: format!("body of {summary}"),
            priority,
            channel: None,
        }
    }

    #[test]
    fn deliver_then_list_then_mark_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let id = store.deliver("aleph-bbbbbbbb", &draft("hello", Priority::Normal)).unwrap();

        let listing = store.list_unread("aleph-bbbbbbbb").unwrap();
        assert_eq!(listing.messages.len(), 1);
        let entry = &listing.messages[0];
        assert_eq!(entry.message_id, id);
        assert_eq!(entry.from, "aleph-aaaaaaaa");
        assert_eq!(entry.summary, "hello");

        store.mark_read("aleph-bbbbbbbb", &id).unwrap();
        assert!(store.list_unread("aleph-bbbbbbbb").unwrap().messages.is_empty());

        // Idempotent.
        store.mark_read("aleph-bbbbbbbb", &id).unwrap();
    }

    #[test]
    fn list_unread_orders_by_priority_then_age() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.deliver("r", &draft("first-normal", Priority::Normal)).unwrap();
        store.deliver("r", &draft("low", Priority::Low)).unwrap();
        store.deliver("r", &draft("urgent", Priority::High)).unwrap();
        store.deliver("r", &draft("second-normal", Priority::Normal)).unwrap();

        let got: Vec<String> = store
            .list_unread("r")
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.summary)
            .collect();
        assert_eq!(got, vec!["urgent", "first-normal", "second-normal", "low"]);
    }

    #[test]
    fn listing_missing_inbox_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.list_unread("nobody").unwrap().messages.is_empty());
    }

    #[test]
    fn malformed_frontmatter_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.deliver("r", &draft("good", Priority::Normal)).unwrap();
        let inbox = store.inbox_dir("r").unwrap();
        fs::write(
            inbox.join("01HZXW0000000000000000BADX.md"),
            "---\nfrom: [unclosed\n---\nbody\n",
        )
        .unwrap();

        let listing = store.list_unread("r").unwrap();
        assert_eq!(listing.messages.len(), 1);
        assert_eq!(listing.quarantined.len(), 1);
        assert!(listing.quarantined[0].starts_with(dir.path().join("quarantine")));
        assert!(!inbox.join("01HZXW0000000000000000BADX.md").exists());
    }

    #[test]
    fn note_without_frontmatter_uses_first_line() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let inbox = store.inbox_dir("r").unwrap();
        fs::create_dir_all(&inbox).unwrap();
        fs::write(inbox.join("01HZXW0000000000000000NOTE.md"), "just a note\nmore\n").unwrap();

        let listing = store.list_unread("r").unwrap();
        assert_eq!(listing.messages.len(), 1);
        assert_eq!(listing.messages[0].summary, "just a note");
        assert_eq!(listing.messages[0].from, "unknown");
    }

    #[test]
    fn concurrent_delivery_yields_distinct_files() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));

        let mut handles = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::new();
                for i in 0..25 {
                    let d = draft(&format!("t{t}-m{i}"), Priority::Normal);
                    ids.push(store.deliver("busy", &d).unwrap());
                }
                ids
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);

        let listing = store.list_unread("busy").unwrap();
        assert_eq!(listing.messages.len(), total);
    }

    #[test]
    fn prune_removes_only_read_messages_over_budget() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut read_ids = Vec::new();
        for i in 0..5 {
            let id = store.deliver("r", &draft(&format!("m{i}"), Priority::Normal)).unwrap();
            if i < 4 {
                store.mark_read("r", &id).unwrap();
                read_ids.push(id);
            }
        }

        let removed = store
            .prune(
                "r",
                PrunePolicy {
                    older_than: None,
                    max_count: Some(1),
                },
            )
            .unwrap();
        assert_eq!(removed, 3);

        // The unread message and the newest read message survive.
        let inbox = store.inbox_dir("r").unwrap();
        let remaining = fs::read_dir(&inbox)
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("md")
            })
            .count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn prune_older_than_keeps_fresh_messages() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = store.deliver("r", &draft("fresh", Priority::Normal)).unwrap();
        store.mark_read("r", &id).unwrap();

        let removed = store
            .prune(
                "r",
                PrunePolicy {
                    older_than: Some(Duration::from_secs(3600)),
                    max_count: None,
                },
            )
            .unwrap();
        assert_eq!(removed, 0);
    }
}
