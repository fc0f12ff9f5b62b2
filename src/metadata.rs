//! Runtime metadata resolution.
//!
//! The metadata document sits at the root of every committed tree and names
//! the runtime together with its matching platform and SDK coordinates.
//! It comes from one of three places, in order:
//!
//! 1. an explicit metadata file, copied verbatim
//! 2. a template with `@ARCH@` and `@VERSION@` placeholders
//! 3. a document synthesized from the image spec, when enabled

use std::fs;
use std::path::{Path, PathBuf};

use crate::branch::{runtime_id, runtime_ref, RoleName};
use crate::error::{Error, IoContext, Result};
use crate::image::ImageSpec;

/// File name of the metadata document inside the staging tree.
pub const METADATA_FILENAME: &str = "metadata";

const ARCH_PLACEHOLDER: &str = "@ARCH@";
const VERSION_PLACEHOLDER: &str = "@VERSION@";

/// Where metadata may come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataSource {
    pub file: Option<PathBuf>,
    pub template: Option<PathBuf>,
    pub synthesize_default: bool,
}

/// How a metadata document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOrigin {
    File,
    Template,
    Default,
}

/// Resolved metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub origin: MetadataOrigin,
    pub content: String,
}

impl Metadata {
    /// Write the document as `metadata` under `root`.
    pub fn write_to(&self, root: &Path) -> Result<PathBuf> {
        let path = root.join(METADATA_FILENAME);
        fs::write(&path, &self.content).at(&path)?;
        Ok(path)
    }

    /// Look up `key` in the document (first match, any group).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.content.lines().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim())
        })
    }
}

/// Resolve the metadata document for `spec`.
///
/// Paths that do not exist are skipped; a path that exists but cannot be
/// read is an I/O error.
pub fn resolve_metadata(spec: &ImageSpec, source: &MetadataSource) -> Result<Metadata> {
    if let Some(file) = existing(source.file.as_deref()) {
        let content = fs::read_to_string(file).at(file)?;
        return Ok(Metadata {
            origin: MetadataOrigin::File,
            content,
        });
    }

    if let Some(template) = existing(source.template.as_deref()) {
        let raw = fs::read_to_string(template).at(template)?;
        return Ok(Metadata {
            origin: MetadataOrigin::Template,
            content: substitute(&raw, spec),
        });
    }

    if source.synthesize_default {
        return Ok(Metadata {
            origin: MetadataOrigin::Default,
            content: default_metadata(spec)?,
        });
    }

    let mut checked = Vec::new();
    if let Some(file) = &source.file {
        checked.push(format!("metadata file '{}'", file.display()));
    }
    if let Some(template) = &source.template {
        checked.push(format!("template '{}'", template.display()));
    }
    let detail = if checked.is_empty() {
        "no metadata file or template configured".to_string()
    } else {
        format!("not found: {}", checked.join(", "))
    };
    Err(Error::Config(format!(
        "no metadata source available ({detail}) and default metadata is disabled"
    )))
}

/// Replace `@ARCH@` and `@VERSION@` literally.
pub fn substitute(template: &str, spec: &ImageSpec) -> String {
    template
        .replace(ARCH_PLACEHOLDER, &spec.architecture())
        .replace(VERSION_PLACEHOLDER, spec.version())
}

/// Minimal `[Runtime]` document naming the runtime and its SDK/platform pair.
pub fn default_metadata(spec: &ImageSpec) -> Result<String> {
    let role = RoleName::for_type(spec.image_type());
    Ok(format!(
        "[Runtime]\nname={}\nruntime={}\nsdk={}\n",
        runtime_id(spec.organization(), role),
        runtime_ref(spec, RoleName::BasePlatform)?,
        runtime_ref(spec, RoleName::BaseSdk)?,
    ))
}

fn existing(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| p.exists())
}
