// src/rundir.rs

//! The on-disk home of a run.
//!
//! Everything that mutates the run directory goes through two primitives:
//!
//! - [`atomic_write`]: write a sibling temporary, fsync, rename. Readers see
//!   either the old or the new complete file, never a torn one.
//! - [`atomic_symlink`]: create a uniquely named sibling symlink, then rename
//!   it over the target. External tools may follow `latest` or `html` at any
//!   moment and must never observe a missing or half-swapped link.
//!
//! [`LockableDirectory`] gives external readers a scoped lock on a report
//! directory so cleanup does not delete it mid-copy.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

/// File written into the working directory by `init`, naming the cache
/// directory that `add-job` and `run-build` should operate on.
pub const CACHE_POINTER: &str = ".litani_cache_dir";

/// Lock file created inside a directory by [`LockableDirectory`].
const LOCK_FILE: &str = ".litani-lock";

/// Sentinel marking a report directory as superseded and safe to delete
/// once unlocked.
const EXPIRED_FILE: &str = ".litani-expired";

/// Atomically replace `path` with `contents`.
pub fn atomic_write(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("cannot atomically write to {:?}: no parent directory", path))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temporary file next to {:?}", path))?;
    tmp.write_all(contents)
        .with_context(|| format!("writing temporary file for {:?}", path))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("syncing temporary file for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("renaming temporary file over {:?}", path))?;

    Ok(())
}

/// Atomically point the symlink at `link` to `target`.
///
/// Creates `link.<uuid>` as a sibling and renames it over `link`, which on
/// POSIX replaces the old link in one step.
#[cfg(unix)]
pub fn atomic_symlink(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    let link = link.as_ref();

    let staged = link.with_file_name(format!(
        "{}.{}",
        link.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "link".to_string()),
        Uuid::new_v4()
    ));

    std::os::unix::fs::symlink(target, &staged)
        .with_context(|| format!("creating staged symlink {:?} -> {:?}", staged, target))?;
    fs::rename(&staged, link)
        .with_context(|| format!("renaming {:?} over {:?}", staged, link))?;

    Ok(())
}

/// Write the cache pointer file into `dir`.
pub fn write_cache_pointer(dir: impl AsRef<Path>, cache_dir: &Path) -> Result<()> {
    let pointer = dir.as_ref().join(CACHE_POINTER);
    atomic_write(&pointer, cache_dir.to_string_lossy().as_bytes())
        .with_context(|| format!("writing cache pointer at {:?}", pointer))
}

/// Locate the cache directory by walking up from the current working
/// directory until a pointer file is found.
pub fn find_cache_dir() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("determining current directory")?;

    for dir in cwd.ancestors() {
        let pointer = dir.join(CACHE_POINTER);
        if pointer.is_file() {
            let contents = fs::read_to_string(&pointer)
                .with_context(|| format!("reading cache pointer {:?}", pointer))?;
            let cache = PathBuf::from(contents.trim());
            debug!(cache_dir = %cache.display(), "resolved cache directory");
            return Ok(cache);
        }
    }

    Err(anyhow!(
        "no {} file found in {:?} or any parent; run `litani init` first",
        CACHE_POINTER,
        cwd
    ))
}

/// Create the run directory, erroring if it already exists.
pub fn create_run_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Err(anyhow!("run directory {:?} already exists", dir));
    }
    fs::create_dir_all(dir).with_context(|| format!("creating run directory {:?}", dir))
}

/// Maintain a `latest` symlink next to the run directory.
#[cfg(unix)]
pub fn update_latest_symlink(run_dir: &Path) -> Result<()> {
    let parent = match run_dir.parent() {
        Some(p) => p,
        None => return Ok(()),
    };
    atomic_symlink(run_dir, parent.join("latest"))
}

/// Mark a directory as expired so cleanup may remove it later.
pub fn mark_expired(dir: &Path) -> Result<()> {
    atomic_write(dir.join(EXPIRED_FILE), b"")
}

/// Whether a directory carries the expiry sentinel.
pub fn is_expired(dir: &Path) -> bool {
    dir.join(EXPIRED_FILE).is_file()
}

/// A scoped lock on a directory, backed by a lock file.
///
/// The lock file is created exclusively; acquisition retries with backoff.
/// It is removed on [`LockableDirectory::release`] or on drop, so the lock
/// also goes away when the owning process exits normally.
#[derive(Debug)]
pub struct LockableDirectory {
    dir: PathBuf,
    held: bool,
}

impl LockableDirectory {
    /// Acquire the lock on `dir`, retrying up to `attempts` times.
    pub fn acquire(dir: impl Into<PathBuf>, attempts: u32) -> Result<Self> {
        let dir = dir.into();
        let lock_path = dir.join(LOCK_FILE);
        let mut backoff = Duration::from_millis(50);

        for attempt in 0..attempts {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    debug!(dir = %dir.display(), "acquired directory lock");
                    return Ok(Self { dir, held: true });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(
                        dir = %dir.display(),
                        attempt,
                        "directory is locked; backing off"
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("creating lock file {:?}", lock_path));
                }
            }
        }

        Err(anyhow!(
            "could not lock {:?} after {} attempts",
            dir,
            attempts
        ))
    }

    /// Whether `dir` is currently locked by anyone.
    pub fn is_locked(dir: &Path) -> bool {
        dir.join(LOCK_FILE).exists()
    }

    /// Release the lock explicitly.
    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(self.dir.join(LOCK_FILE)) {
                warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "failed to remove lock file"
                );
            }
            self.held = false;
        }
    }
}

impl Drop for LockableDirectory {
    fn drop(&mut self) {
        self.release();
    }
}
