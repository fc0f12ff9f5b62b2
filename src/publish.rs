//! Commit orchestration.
//!
//! [`publish`] runs one image through the whole pipeline:
//!
//! ```text
//! compute branch ─► resolve metadata ─► library manifest (optional)
//!        │
//!        ▼
//! staging tree ─► relocate ─► fix permissions ─► metadata
//!        │
//!        ▼
//! store.init ─► store.commit ─► store.refresh_summary ─► remove staging
//! ```
//!
//! Everything that can fail on bad input happens before the staging tree
//! exists. Once it exists, it is removed on every exit path.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::branch::{compute_branch, BranchId};
use crate::config::PublishConfig;
use crate::error::{Error, IoContext, Result};
use crate::image::ImageSpec;
use crate::libraries::write_library_manifest;
use crate::metadata::resolve_metadata;
use crate::relocate::{fix_permissions, relocate, RelocationStats};
use crate::source::ImageSource;
use crate::staging::{sweep_stale, StagingTree};
use crate::store::{CommitRequest, StoreClient};

/// Files in every commit are owned by root, whoever built the image.
pub const OWNER_UID: u32 = 0;
pub const OWNER_GID: u32 = 0;

/// What a successful commit produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub branch: BranchId,
    pub commit_id: String,
    pub subject: String,
}

/// Everything a finished run reports.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub commit: CommitResult,
    pub relocation: RelocationStats,
    pub permissions_fixed: usize,
    /// Number of manifest entries, when a manifest was requested.
    pub libraries: Option<usize>,
}

/// JSON record of a finished run.
#[derive(Debug, Serialize)]
pub struct CommitRecord<'a> {
    pub branch: &'a BranchId,
    pub commit_id: &'a str,
    pub subject: &'a str,
    pub repo: &'a Path,
    pub source: &'a Path,
    pub finished_at_utc: String,
}

/// `"<type> <version>"`, e.g. `sdk 1.2.3`.
pub fn commit_subject(spec: &ImageSpec) -> String {
    format!("{} {}", spec.image_type(), spec.version())
}

pub fn commit_body(source: &ImageSource) -> String {
    format!("Commit of {} into the repository.", source.path().display())
}

/// Commit `tree` to `branch` and refresh the repository summary.
///
/// The summary is only refreshed after the commit succeeded.
pub fn commit<S: StoreClient + ?Sized>(
    store: &S,
    config: &PublishConfig,
    tree: &Path,
    branch: &BranchId,
) -> Result<CommitResult> {
    let subject = commit_subject(&config.spec);
    let body = commit_body(&config.source);

    store.init(&config.repo, config.repo_mode)?;

    let request = CommitRequest {
        repo: &config.repo,
        tree,
        branch,
        subject: &subject,
        body: &body,
        owner_uid: OWNER_UID,
        owner_gid: OWNER_GID,
        strip_xattrs: true,
        signing: &config.signing,
    };
    let commit_id = store.commit(&request)?;

    store.refresh_summary(&config.repo, &config.signing)?;

    Ok(CommitResult {
        branch: branch.clone(),
        commit_id,
        subject,
    })
}

/// Run the full pipeline for `config` against `store`.
pub fn publish<S: StoreClient + ?Sized>(config: &PublishConfig, store: &S) -> Result<PublishOutcome> {
    let tag = "[image-commit]";

    let branch = compute_branch(&config.spec)?;
    println!("{tag} target branch {branch}");

    let metadata = resolve_metadata(&config.spec, &config.metadata)?;
    store.preflight()?;

    if let Some(manifest) = &config.library_manifest {
        println!("{tag} writing library manifest {}", manifest.display());
    }
    let libraries = write_library_manifest(
        &config.source,
        &config.library_pattern,
        config.library_manifest.as_deref(),
    )?;

    match sweep_stale(&config.work_dir) {
        Ok(0) => {}
        Ok(removed) => println!("{tag} removed {removed} stale staging run(s)"),
        Err(err) => warn!(error = %err, "failed to sweep stale staging runs"),
    }

    let staging = StagingTree::create(&config.work_dir)?;

    println!(
        "{tag} relocating {} into {}",
        config.source.path().display(),
        staging.path().display()
    );
    let relocation = relocate(&config.source, &config.mapping, staging.path())?;
    let permissions_fixed = fix_permissions(staging.path())?;
    metadata.write_to(staging.path())?;

    println!("{tag} committing to {}", config.repo.display());
    let commit = commit(store, config, staging.path(), &branch)?;
    println!("{tag} committed {} as {}", commit.branch, commit.commit_id);

    staging.remove()?;

    if let Some(record) = &config.record {
        write_record(record, config, &commit)?;
    }

    Ok(PublishOutcome {
        commit,
        relocation,
        permissions_fixed,
        libraries,
    })
}

/// Write the JSON run record via a temp file and rename.
fn write_record(path: &Path, config: &PublishConfig, commit: &CommitResult) -> Result<()> {
    let record = CommitRecord {
        branch: &commit.branch,
        commit_id: &commit.commit_id,
        subject: &commit.subject,
        repo: &config.repo,
        source: config.source.path(),
        finished_at_utc: now_utc_rfc3339(),
    };
    let bytes = serde_json::to_vec_pretty(&record).map_err(|e| Error::io(path, e.into()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).at(parent)?;
    }
    let tmp = tmp_sibling(path);
    fs::write(&tmp, bytes).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{nanos}"));
    path.with_file_name(name)
}

fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
