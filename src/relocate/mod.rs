//! Relocate an image tree into the committed layout.
//!
//! Every entry of the source image (directory walk or tar stream) is passed
//! through a [`PathMapping`]; kept entries are written under the destination
//! root at their mapped path. Directory modes are applied last, deepest
//! first, so restrictive modes never block writing the content below them.
//!
//! # Example
//!
//! ```rust,ignore
//! use image_commit::relocate::{relocate, fix_permissions, PathMapping};
//! use image_commit::source::ImageSource;
//! use std::path::Path;
//!
//! let source = ImageSource::Tarball("core-image-flatpak-runtime.tar.bz2".into());
//! relocate(&source, &PathMapping::default(), Path::new("/var/tmp/tree"))?;
//! fix_permissions(Path::new("/var/tmp/tree"))?;
//! ```

mod fixup;
mod rules;

pub use fixup::fix_permissions;
pub(crate) use fixup::walk_unlocking;
pub use rules::{PathMapping, RewriteRule, Unmatched};

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};
use crate::source::{clean_relative, open_archive, walk_error, ImageSource};

/// Counts of what a relocation wrote and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationStats {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hardlinks: usize,
    pub excluded: usize,
    pub unsupported: usize,
}

/// Relocate `source` into `dest_root` according to `mapping`.
pub fn relocate(
    source: &ImageSource,
    mapping: &PathMapping,
    dest_root: &Path,
) -> Result<RelocationStats> {
    fs::create_dir_all(dest_root).at(dest_root)?;

    let mut writer = TreeWriter::new(dest_root);
    match source {
        ImageSource::Sysroot(root) => relocate_tree(root, mapping, &mut writer)?,
        ImageSource::Tarball(path) => relocate_archive(path, mapping, &mut writer)?,
    }
    writer.finish()
}

fn relocate_tree(root: &Path, mapping: &PathMapping, writer: &mut TreeWriter) -> Result<()> {
    if !root.is_dir() {
        return Err(Error::io(
            root,
            io::Error::new(io::ErrorKind::NotFound, "image root is not a readable directory"),
        ));
    }

    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        let src = entry.path();
        let rel = src.strip_prefix(root).unwrap_or(src);
        let Some(target) = mapping.map(rel) else {
            writer.stats.excluded += 1;
            if entry.file_type().is_dir() && !mapping.may_contain(rel) {
                walker.skip_current_dir();
            }
            continue;
        };

        let file_type = entry.file_type();
        let metadata = fs::symlink_metadata(src).at(src)?;
        let mode = metadata.permissions().mode();

        if file_type.is_dir() {
            writer.dir(&target, mode)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(src).at(src)?;
            writer.symlink(&target, &link)?;
        } else if file_type.is_file() {
            let dst = writer.prepare(&target)?;
            fs::copy(src, &dst).at(src)?;
            writer.stats.files += 1;
        } else {
            warn!(path = %src.display(), "skipping special file");
            writer.stats.unsupported += 1;
        }
    }

    Ok(())
}

fn relocate_archive(path: &Path, mapping: &PathMapping, writer: &mut TreeWriter) -> Result<()> {
    let mut archive = open_archive(path)?;

    for entry in archive.entries().at(path)? {
        let mut entry = entry.at(path)?;
        let entry_path = entry.path().at(path)?.into_owned();
        let Some(rel) = clean_relative(&entry_path)? else {
            continue;
        };
        let kind = entry.header().entry_type();
        if matches!(
            kind,
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader
        ) {
            continue;
        }
        let Some(target) = mapping.map(&rel) else {
            writer.stats.excluded += 1;
            continue;
        };
        let mode = entry.header().mode().at(path)?;

        match kind {
            tar::EntryType::Directory => writer.dir(&target, mode)?,
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                let dst = writer.prepare(&target)?;
                let mut file = File::create(&dst).at(&dst)?;
                io::copy(&mut entry, &mut file).at(&dst)?;
                drop(file);
                fs::set_permissions(&dst, fs::Permissions::from_mode(mode & 0o7777)).at(&dst)?;
                writer.stats.files += 1;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .at(path)?
                    .ok_or_else(|| Error::InvalidPath(rel.display().to_string()))?
                    .into_owned();
                writer.symlink(&target, &link)?;
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .at(path)?
                    .ok_or_else(|| Error::InvalidPath(rel.display().to_string()))?
                    .into_owned();
                let linked = clean_relative(&link)?.and_then(|rel| mapping.map(&rel));
                match linked {
                    Some(linked) => writer.hardlink(&target, &linked)?,
                    None => {
                        warn!(
                            entry = %rel.display(),
                            target = %link.display(),
                            "skipping hard link to excluded entry"
                        );
                        writer.stats.unsupported += 1;
                    }
                }
            }
            other => {
                warn!(entry = %rel.display(), kind = ?other, "skipping unsupported entry type");
                writer.stats.unsupported += 1;
            }
        }
    }

    Ok(())
}

/// Writes mapped entries below a destination root.
struct TreeWriter {
    root: PathBuf,
    dir_modes: Vec<(PathBuf, u32)>,
    stats: RelocationStats,
}

impl TreeWriter {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dir_modes: Vec::new(),
            stats: RelocationStats::default(),
        }
    }

    /// `root/rel`, refusing any path whose parents pass through a symlink
    /// already written into the tree. Writes never leave the root.
    fn contained(&self, rel: &Path) -> Result<PathBuf> {
        let invalid = |why: String| Error::InvalidPath(format!("{}: {why}", rel.display()));

        let mut current = self.root.clone();
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            let Component::Normal(name) = component else {
                return Err(invalid(format!("unexpected component {component:?}")));
            };
            current.push(name);
            if components.peek().is_none() {
                break;
            }
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(invalid(format!(
                        "parent '{}' is a symlink",
                        current.strip_prefix(&self.root).unwrap_or(&current).display()
                    )));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                Err(err) => return Err(Error::io(&current, err)),
            }
        }
        Ok(self.root.join(rel))
    }

    /// Absolute destination for `rel` with its parent created and any
    /// previous non-directory entry removed.
    fn prepare(&self, rel: &Path) -> Result<PathBuf> {
        let dst = self.contained(rel)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        if dst.is_symlink() || dst.is_file() {
            fs::remove_file(&dst).at(&dst)?;
        }
        Ok(dst)
    }

    fn dir(&mut self, rel: &Path, mode: u32) -> Result<()> {
        let dst = self.contained(rel)?;
        if dst.is_symlink() {
            return Err(Error::InvalidPath(format!(
                "{}: directory entry over an existing symlink",
                rel.display()
            )));
        }
        fs::create_dir_all(&dst).at(&dst)?;
        self.dir_modes.push((dst, mode & 0o7777));
        self.stats.directories += 1;
        Ok(())
    }

    fn symlink(&mut self, rel: &Path, link: &Path) -> Result<()> {
        let dst = self.prepare(rel)?;
        std::os::unix::fs::symlink(link, &dst).at(&dst)?;
        self.stats.symlinks += 1;
        Ok(())
    }

    fn hardlink(&mut self, rel: &Path, existing: &Path) -> Result<()> {
        let original = self.contained(existing)?;
        let dst = self.prepare(rel)?;
        fs::hard_link(&original, &dst).at(&dst)?;
        self.stats.hardlinks += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<RelocationStats> {
        self.dir_modes
            .sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in &self.dir_modes {
            fs::set_permissions(path, fs::Permissions::from_mode(*mode)).at(path)?;
        }
        debug!(stats = ?self.stats, root = %self.root.display(), "relocation finished");
        Ok(self.stats)
    }
}
