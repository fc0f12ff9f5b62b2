//! Shared-library inventory of an image.
//!
//! Lists every path in the image that looks like a versioned shared library
//! (`lib/lib` followed later by `.so.`) as an absolute path, one per line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{IoContext, Result};
use crate::source::{clean_relative, open_archive, walk_error, ImageSource};

/// Substring pair a library path must contain, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryPattern {
    pub anchor: String,
    pub marker: String,
}

impl Default for LibraryPattern {
    fn default() -> Self {
        Self {
            anchor: "lib/lib".to_string(),
            marker: ".so.".to_string(),
        }
    }
}

impl LibraryPattern {
    /// True when `path` contains `anchor` followed somewhere by `marker`.
    pub fn matches(&self, path: &str) -> bool {
        match path.find(&self.anchor) {
            Some(at) => path[at + self.anchor.len()..].contains(&self.marker),
            None => false,
        }
    }
}

/// A restartable scan over an image; every `visit` rescans the source.
#[derive(Debug, Clone)]
pub struct LibraryScan<'a> {
    source: &'a ImageSource,
    pattern: &'a LibraryPattern,
}

impl<'a> LibraryScan<'a> {
    pub fn new(source: &'a ImageSource, pattern: &'a LibraryPattern) -> Self {
        Self { source, pattern }
    }

    /// Stream each matching absolute path to `f`, in image order.
    ///
    /// Directories never match; files and symlinks do.
    pub fn visit(&self, mut f: impl FnMut(&str) -> Result<()>) -> Result<()> {
        match self.source {
            ImageSource::Sysroot(root) => {
                for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
                    let entry = entry.map_err(|e| walk_error(root, e))?;
                    if entry.file_type().is_dir() {
                        continue;
                    }
                    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
                    self.offer(rel, &mut f)?;
                }
            }
            ImageSource::Tarball(path) => {
                let mut archive = open_archive(path)?;
                for entry in archive.entries().at(path)? {
                    let entry = entry.at(path)?;
                    if entry.header().entry_type().is_dir() {
                        continue;
                    }
                    let entry_path = entry.path().at(path)?;
                    self.offer(&entry_path, &mut f)?;
                }
            }
        }
        Ok(())
    }

    /// Collect every match.
    pub fn collect(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.visit(|path| {
            out.push(path.to_string());
            Ok(())
        })?;
        Ok(out)
    }

    fn offer(&self, rel: &Path, f: &mut impl FnMut(&str) -> Result<()>) -> Result<()> {
        let Some(rel) = clean_relative(rel)? else {
            return Ok(());
        };
        let absolute = format!("/{}", rel.to_string_lossy());
        if self.pattern.matches(&absolute) {
            f(&absolute)?;
        }
        Ok(())
    }
}

/// Write the library manifest for `source` to `output`.
///
/// Without an output path nothing is scanned and `Ok(None)` is returned.
/// Zero matches still create an empty manifest.
pub fn write_library_manifest(
    source: &ImageSource,
    pattern: &LibraryPattern,
    output: Option<&Path>,
) -> Result<Option<usize>> {
    let Some(output) = output else {
        return Ok(None);
    };

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    let mut writer = BufWriter::new(File::create(output).at(output)?);
    let mut count = 0usize;
    LibraryScan::new(source, pattern).visit(|path| {
        writeln!(writer, "{path}").at(output)?;
        count += 1;
        Ok(())
    })?;
    writer.flush().at(output)?;

    Ok(Some(count))
}
