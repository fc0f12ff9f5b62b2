//! Permission fixup for relocated trees.
//!
//! Images sometimes ship files with mode 000 (e.g. `/etc/shadow`). The
//! repository store has to read every file, so regular files get owner-read.
//! Directories keep the image's mode unless the owner cannot list them, in
//! which case they get owner `r-x`. Nothing else changes.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{IoContext, Result};
use crate::source::walk_error;

const FILE_MIN: u32 = 0o400;
const DIR_MIN: u32 = 0o500;

/// Ensure owner access below `root`; returns the number of entries changed.
///
/// Symlinks are not followed. Running it twice changes nothing the second
/// time.
pub fn fix_permissions(root: &Path) -> Result<usize> {
    let mut files = 0usize;
    let dirs = walk_unlocking(root, DIR_MIN, |entry| {
        if entry.file_type().is_file() && ensure_mode(entry.path(), FILE_MIN)? {
            files += 1;
        }
        Ok(())
    })?;

    let changed = files + dirs;
    if changed > 0 {
        debug!(root = %root.display(), changed, "raised owner permissions");
    }
    Ok(changed)
}

/// Walk `root` without following symlinks, giving every directory at least
/// the `dir_min` owner bits, and call `visit` for every non-directory entry.
///
/// `WalkDir` opens a directory before yielding it, so a directory the owner
/// cannot list shows up as a permission error. It is unlocked and the walk
/// starts over; `visit` may therefore see an entry more than once. Returns
/// the number of directories changed.
pub(crate) fn walk_unlocking(
    root: &Path,
    dir_min: u32,
    mut visit: impl FnMut(&DirEntry) -> Result<()>,
) -> Result<usize> {
    let mut unlocked: HashSet<PathBuf> = HashSet::new();

    loop {
        let mut rewalk = false;
        let mut changed_this_walk: HashSet<PathBuf> = HashSet::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let denied = err
                        .io_error()
                        .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied);
                    let dir = err.path().filter(|p| is_real_dir(p)).map(Path::to_path_buf);
                    match dir {
                        Some(dir) if denied => {
                            let changed = ensure_mode(&dir, dir_min)?;
                            if !changed && !changed_this_walk.contains(&dir) {
                                return Err(walk_error(root, err));
                            }
                            unlocked.insert(dir);
                            rewalk = true;
                            continue;
                        }
                        _ => return Err(walk_error(root, err)),
                    }
                }
            };

            if entry.file_type().is_dir() {
                if ensure_mode(entry.path(), dir_min)? {
                    unlocked.insert(entry.path().to_path_buf());
                    changed_this_walk.insert(entry.path().to_path_buf());
                }
            } else {
                visit(&entry)?;
            }
        }

        if !rewalk {
            return Ok(unlocked.len());
        }
    }
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_dir())
}

fn ensure_mode(path: &Path, min: u32) -> Result<bool> {
    let mode = fs::symlink_metadata(path).at(path)?.permissions().mode();
    if mode & min == min {
        return Ok(false);
    }
    fs::set_permissions(path, fs::Permissions::from_mode((mode | min) & 0o7777)).at(path)?;
    Ok(true)
}
