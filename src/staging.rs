//! Scratch staging trees.
//!
//! Each run stages its image under a process-unique directory:
//!
//! ```text
//! <work_dir>/
//! ├── run-<pid>-<nanos>.lock   # held exclusively while the run lives
//! └── run-<pid>-<nanos>/
//!     └── tree/                # what gets committed
//! ```
//!
//! The lock is not mutual exclusion between users of one path (paths are
//! never shared). It only lets a later run tell a crashed run's leftovers
//! from a live one: if the lock can be taken, its owner is gone.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};
use crate::relocate::walk_unlocking;

const RUN_PREFIX: &str = "run-";
const LOCK_SUFFIX: &str = ".lock";
const TREE_DIR: &str = "tree";

/// An exclusively owned staging tree, removed when dropped.
#[derive(Debug)]
pub struct StagingTree {
    run_dir: PathBuf,
    tree: PathBuf,
    lock_path: PathBuf,
    lock: Option<File>,
    removed: bool,
}

impl StagingTree {
    /// Create a fresh, empty staging tree below `work_dir`.
    pub fn create(work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir).at(work_dir)?;

        let name = run_name();
        let lock_path = work_dir.join(format!("{name}{LOCK_SUFFIX}"));
        let run_dir = work_dir.join(&name);

        // Lock before the directory exists so a sweeper never sees an
        // unlocked run directory belonging to a live process.
        let lock = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .at(&lock_path)?;
        lock.try_lock_exclusive().at(&lock_path)?;

        let staging = Self {
            tree: run_dir.join(TREE_DIR),
            run_dir,
            lock_path,
            lock: Some(lock),
            removed: false,
        };

        // On failure the guard drops and cleans up after itself.
        fs::create_dir(&staging.run_dir).at(&staging.run_dir)?;
        fs::create_dir(&staging.tree).at(&staging.tree)?;

        debug!(tree = %staging.tree.display(), "created staging tree");
        Ok(staging)
    }

    /// Root of the tree to populate and commit.
    pub fn path(&self) -> &Path {
        &self.tree
    }

    /// Remove the staging tree, reporting failure.
    pub fn remove(mut self) -> Result<()> {
        self.remove_inner()
    }

    fn remove_inner(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;

        let result = remove_tree(&self.run_dir);
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
        let _ = fs::remove_file(&self.lock_path);
        result
    }
}

impl Drop for StagingTree {
    fn drop(&mut self) {
        if let Err(err) = self.remove_inner() {
            warn!(
                path = %self.run_dir.display(),
                error = %err,
                "failed to remove staging tree"
            );
        }
    }
}

/// Remove staging runs in `work_dir` whose owning process is gone.
///
/// Returns the number of runs removed. Run directories without a lock file
/// are left alone.
pub fn sweep_stale(work_dir: &Path) -> Result<usize> {
    if !work_dir.is_dir() {
        return Ok(0);
    }

    let mut removed = 0usize;
    for entry in fs::read_dir(work_dir).at(work_dir)? {
        let entry = entry.at(work_dir)?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(RUN_PREFIX) || name.ends_with(LOCK_SUFFIX) {
            continue;
        }
        if !entry.file_type().at(&path)?.is_dir() {
            continue;
        }

        let lock_path = work_dir.join(format!("{name}{LOCK_SUFFIX}"));
        let lock = match OpenOptions::new().read(true).write(true).open(&lock_path) {
            Ok(lock) => lock,
            Err(_) => {
                debug!(path = %path.display(), "run directory has no lock file, leaving it");
                continue;
            }
        };
        if lock.try_lock_exclusive().is_err() {
            continue;
        }

        warn!(path = %path.display(), "removing stale staging run");
        remove_tree(&path)?;
        let _ = lock.unlock();
        drop(lock);
        let _ = fs::remove_file(&lock_path);
        removed += 1;
    }

    Ok(removed)
}

/// `remove_dir_all`, retrying once after making directories writable.
fn remove_tree(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }
    make_writable(path)?;
    fs::remove_dir_all(path).map_err(|e| Error::io(path, e))
}

/// Give every directory below `dir` owner rwx so its entries can be unlinked.
fn make_writable(dir: &Path) -> Result<()> {
    walk_unlocking(dir, 0o700, |_| Ok(()))?;
    Ok(())
}

fn run_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{RUN_PREFIX}{}-{nanos}", std::process::id())
}
