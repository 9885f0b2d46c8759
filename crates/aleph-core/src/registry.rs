//! The live-agent registry: one JSON row per agent under `registry/`.
//!
//! Each row is written only by its owning process; readers are lock-free.
//! Stale rows (dead PID and an old heartbeat) are garbage-collected by
//! whoever scans next.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use crate::agent::AgentRecord;
use crate::fsio::{self, FsError};
use crate::paths::{scoped_dir, NameError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid agent id: {0}")]
    BadAgentId(#[from] NameError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid registry record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, agent_id: &str) -> Result<PathBuf, RegistryError> {
        Ok(scoped_dir(&self.dir, agent_id)?.with_extension("json"))
    }

    pub fn write(&self, record: &AgentRecord) -> Result<(), RegistryError> {
        let path = self.record_path(&record.agent_id)?;
        let data = serde_json::to_vec_pretty(record).map_err(|source| RegistryError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fsio::atomic_write(&path, &data)?;
        Ok(())
    }

    pub fn read(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        let path = self.record_path(agent_id)?;
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|source| RegistryError::Corrupt { path, source }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Missing rows are fine; deregistration races with GC.
    pub fn remove(&self, agent_id: &str) -> Result<(), RegistryError> {
        let path = self.record_path(agent_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn heartbeat(
        &self,
        record: &mut AgentRecord,
        now: OffsetDateTime,
    ) -> Result<(), RegistryError> {
        record.touch(now);
        self.write(record)
    }

    /// All parseable rows. Corrupt files are skipped (the next prune pass
    /// rebuilds the registry from what is actually alive).
    pub fn list(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(record) = serde_json::from_str::<AgentRecord>(&text) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    /// Drop rows whose process is dead AND whose heartbeat has lapsed.
    /// Returns the ids removed. Corrupt row files are removed outright.
    pub fn prune_stale(
        &self,
        now: OffsetDateTime,
        is_alive: impl Fn(u32) -> bool,
    ) -> Result<Vec<String>, RegistryError> {
        let mut removed = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: Option<AgentRecord> = fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok());

            let stale = match &record {
                Some(record) => {
                    let age = now - record.last_heartbeat;
                    !is_alive(record.pid) && age >= STALE_AFTER
                }
                // Unparsable rows carry no liveness evidence at all.
                None => true,
            };
            if stale {
                let _ = fs::remove_file(&path);
                let id = record.map(|r| r.agent_id).unwrap_or_else(|| {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_owned()
                });
                removed.push(id);
            }
        }
        Ok(removed)
    }
}

/// PID liveness via /proc. On platforms without /proc the caller should
/// supply its own probe to `prune_stale`.
pub fn proc_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
