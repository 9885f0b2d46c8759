//! Filesystem primitives: atomic writes, advisory locks, directory polling.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("cross-device rename: {from} -> {to}")]
    CrossDevice { from: PathBuf, to: PathBuf },
    #[error("lock contended: {0}")]
    LockContended(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn nonce() -> String {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        // Degrade to the pid alone; the tmp name stays unique per process.
        return String::new();
    }
    let mut out = String::with_capacity(8);
    for b in buf {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Write `bytes` to `path` via a same-directory tmp file, fsync, and rename.
///
/// Readers never observe a torn file. The tmp file lives next to the target
/// so the rename stays on one filesystem; a cross-device rename is reported
/// as its own error kind rather than a generic I/O failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let Some(parent) = path.parent() else {
        return Err(FsError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no parent directory: {}", path.display()),
        )));
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_owned());
    let tmp = parent.join(format!(
        "{file_name}.tmp.{}.{}",
        std::process::id(),
        nonce()
    ));

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            let _ = fs::remove_file(&tmp);
            Err(FsError::CrossDevice {
                from: tmp,
                to: path.to_path_buf(),
            })
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err.into())
        }
    }
}

/// An advisory flock-style lock, released on drop (and by the OS on process
/// exit regardless of state).
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

impl LockFile {
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self, FsError> {
        Self::acquire(path, timeout, false)
    }

    pub fn shared(path: &Path, timeout: Duration) -> Result<Self, FsError> {
        Self::acquire(path, timeout, true)
    }

    fn acquire(path: &Path, timeout: Duration, shared: bool) -> Result<Self, FsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = if shared {
                file.try_lock_shared()
            } else {
                file.try_lock()
            };
            match attempt {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(_) => return Err(FsError::LockContended(path.to_path_buf())),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// The set of new and vanished children since the previous scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirChange {
    pub created: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl DirChange {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }
}

/// Poll-based directory watcher. Lossy by contract: a scan only says
/// "something changed, go look". The caller picks the cadence.
#[derive(Debug)]
pub struct DirWatcher {
    dir: PathBuf,
    seen: BTreeSet<OsString>,
}

impl DirWatcher {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            seen: BTreeSet::new(),
        }
    }

    pub fn scan(&mut self) -> Result<DirChange, FsError> {
        let mut current = BTreeSet::new();
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    current.insert(entry?.file_name());
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut change = DirChange::default();
        for name in current.difference(&self.seen) {
            change.created.push(self.dir.join(name));
        }
        for name in self.seen.difference(&current) {
            change.removed.push(self.dir.join(name));
        }
        self.seen = current;
        Ok(change)
    }
}
