//! Run configuration.
//!
//! A [`PublishConfig`] is built once from an optional TOML file and the
//! command line, validated, and then passed by reference to every step.
//! Command line values win over file values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, IoContext, Result};
use crate::image::{ImageSpec, ImageType};
use crate::libraries::LibraryPattern;
use crate::metadata::MetadataSource;
use crate::relocate::{PathMapping, RewriteRule, Unmatched};
use crate::source::ImageSource;
use crate::store::{RepoMode, Signing, SummaryTool};

/// Organization id used when neither the file nor the command line sets one.
pub const DEFAULT_ORGANIZATION: &str = "org.yocto";

/// Fully validated settings for one run.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub repo: PathBuf,
    pub spec: ImageSpec,
    pub source: ImageSource,
    pub mapping: PathMapping,
    pub metadata: MetadataSource,
    pub library_manifest: Option<PathBuf>,
    pub library_pattern: LibraryPattern,
    pub signing: Signing,
    pub repo_mode: RepoMode,
    pub summary: SummaryTool,
    pub work_dir: PathBuf,
    pub record: Option<PathBuf>,
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub repo: Option<PathBuf>,
    pub image: Option<PathBuf>,
    pub sysroot: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub architecture: Option<String>,
    pub version: Option<String>,
    pub image_type: Option<String>,
    pub organization: Option<String>,
    pub metadata: Option<PathBuf>,
    pub metadata_template: Option<PathBuf>,
    pub no_default_metadata: bool,
    pub library_manifest: Option<PathBuf>,
    pub gpg_home: Option<PathBuf>,
    pub gpg_key: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub summary: Option<String>,
    pub record: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    organization: Option<String>,
    work_dir: Option<PathBuf>,
    relocation: Option<RelocationToml>,
    metadata: Option<MetadataToml>,
    libraries: Option<LibrariesToml>,
    store: Option<StoreToml>,
    signing: Option<Signing>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelocationToml {
    rules: Option<Vec<RewriteRule>>,
    unmatched: Option<String>,
    allow: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetadataToml {
    file: Option<PathBuf>,
    template: Option<PathBuf>,
    synthesize_default: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LibrariesToml {
    anchor: Option<String>,
    marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreToml {
    mode: Option<String>,
    summary: Option<SummaryTool>,
}

impl ConfigFile {
    /// Read and parse a config file; relative paths inside it are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).at(path)?;
        let mut parsed: Self = toml::from_str(&raw).map_err(|e| {
            Error::Config(format!("parsing config '{}': {e}", path.display()))
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        parsed.work_dir = parsed.work_dir.map(|p| resolve_path(base, &p));
        if let Some(metadata) = parsed.metadata.as_mut() {
            metadata.file = metadata.file.take().map(|p| resolve_path(base, &p));
            metadata.template = metadata.template.take().map(|p| resolve_path(base, &p));
        }
        if let Some(signing) = parsed.signing.as_mut() {
            signing.gpg_home = signing.gpg_home.take().map(|p| resolve_path(base, &p));
        }
        Ok(parsed)
    }
}

impl PublishConfig {
    /// Merge `file` and `cli` into a validated configuration.
    pub fn build(file: ConfigFile, cli: Overrides) -> Result<Self> {
        let repo = cli
            .repo
            .ok_or_else(|| Error::Config("repository path is required (--repo)".into()))?;
        let architecture = cli
            .architecture
            .ok_or_else(|| Error::Config("architecture is required (--arch)".into()))?;
        let version = cli
            .version
            .ok_or_else(|| Error::Config("image version is required (--version)".into()))?;
        let image_type: ImageType = cli
            .image_type
            .ok_or_else(|| Error::Config("image type is required (--type sdk|runtime)".into()))?
            .parse()?;
        let organization = cli
            .organization
            .or(file.organization)
            .unwrap_or_else(|| DEFAULT_ORGANIZATION.to_string());

        let spec = ImageSpec::new(image_type, architecture, version, organization)?;
        let source = ImageSource::resolve(
            cli.image.as_deref(),
            cli.sysroot.as_deref(),
            cli.build_dir.as_deref(),
            &spec,
        )?;

        let mapping = build_mapping(file.relocation)?;

        let metadata_file = file.metadata.unwrap_or(MetadataToml {
            file: None,
            template: None,
            synthesize_default: None,
        });
        let metadata = MetadataSource {
            file: cli.metadata.or(metadata_file.file),
            template: cli.metadata_template.or(metadata_file.template),
            synthesize_default: !cli.no_default_metadata
                && metadata_file.synthesize_default.unwrap_or(true),
        };

        let mut library_pattern = LibraryPattern::default();
        if let Some(libraries) = file.libraries {
            if let Some(anchor) = libraries.anchor {
                library_pattern.anchor = anchor;
            }
            if let Some(marker) = libraries.marker {
                library_pattern.marker = marker;
            }
        }

        let file_signing = file.signing.unwrap_or_default();
        let gpg_key = cli.gpg_key.or(file_signing.gpg_key);
        let gpg_home = cli
            .gpg_home
            .or(file_signing.gpg_home)
            .or_else(|| gpg_key.as_ref().and_then(|_| default_gpg_home()));
        let signing = Signing { gpg_home, gpg_key };

        let (repo_mode, file_summary) = match file.store {
            Some(store) => (
                store
                    .mode
                    .as_deref()
                    .map(str::parse::<RepoMode>)
                    .transpose()?
                    .unwrap_or_default(),
                store.summary,
            ),
            None => (RepoMode::default(), None),
        };
        let summary = match cli.summary {
            Some(summary) => summary.parse::<SummaryTool>()?,
            None => file_summary.unwrap_or_default(),
        };

        let work_dir = cli
            .work_dir
            .or(file.work_dir)
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            repo,
            spec,
            source,
            mapping,
            metadata,
            library_manifest: cli.library_manifest,
            library_pattern,
            signing,
            repo_mode,
            summary,
            work_dir,
            record: cli.record,
        })
    }
}

fn build_mapping(relocation: Option<RelocationToml>) -> Result<PathMapping> {
    let Some(relocation) = relocation else {
        return Ok(PathMapping::default());
    };

    let rules = relocation
        .rules
        .unwrap_or_else(|| PathMapping::default().rules);
    for rule in &rules {
        if rule.from.is_absolute() || rule.to.is_absolute() {
            return Err(Error::Config(format!(
                "relocation rule '{}' -> '{}' must use relative paths",
                rule.from.display(),
                rule.to.display()
            )));
        }
    }

    let unmatched = match relocation.unmatched.as_deref().unwrap_or("exclude") {
        "exclude" => Unmatched::Exclude,
        "pass-through" => Unmatched::PassThrough,
        "allow-list" => Unmatched::AllowList(relocation.allow.ok_or_else(|| {
            Error::Config("relocation.unmatched = \"allow-list\" requires relocation.allow".into())
        })?),
        other => {
            return Err(Error::Validation(format!(
                "unsupported relocation.unmatched '{other}'; expected exclude, pass-through or allow-list"
            )))
        }
    };

    Ok(PathMapping { rules, unmatched })
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_gpg_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gnupg"))
}
