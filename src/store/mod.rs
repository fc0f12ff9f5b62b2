//! Repository store collaborator.
//!
//! Committing, hashing, deduplication and summary signing belong to the
//! external store. This module defines the narrow interface the commit
//! orchestration talks to; [`ostree::OstreeCli`] implements it by running
//! the host tools.

pub mod ostree;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::branch::BranchId;
use crate::error::{Error, Result};

pub use ostree::{OstreeCli, SummaryTool};

/// Repository storage mode passed to `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepoMode {
    #[default]
    ArchiveZ2,
    Bare,
    BareUser,
}

impl RepoMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArchiveZ2 => "archive-z2",
            Self::Bare => "bare",
            Self::BareUser => "bare-user",
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "archive-z2" | "archive" => Ok(Self::ArchiveZ2),
            "bare" => Ok(Self::Bare),
            "bare-user" => Ok(Self::BareUser),
            other => Err(Error::Validation(format!(
                "unsupported repository mode '{other}'; expected archive-z2, bare or bare-user"
            ))),
        }
    }
}

/// GPG signing options shared by every signed store call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signing {
    pub gpg_home: Option<PathBuf>,
    pub gpg_key: Option<String>,
}

impl Signing {
    /// Signing happens only when a key is configured.
    pub fn is_enabled(&self) -> bool {
        self.gpg_key.is_some()
    }

    /// `--gpg-homedir`/`--gpg-sign` arguments, empty when disabled.
    pub fn args(&self) -> Vec<String> {
        let Some(key) = &self.gpg_key else {
            return Vec::new();
        };
        let mut args = Vec::new();
        if let Some(home) = &self.gpg_home {
            args.push(format!("--gpg-homedir={}", home.display()));
        }
        args.push(format!("--gpg-sign={key}"));
        args
    }
}

/// Everything the store needs to record one commit.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub repo: &'a Path,
    pub tree: &'a Path,
    pub branch: &'a BranchId,
    pub subject: &'a str,
    pub body: &'a str,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub strip_xattrs: bool,
    pub signing: &'a Signing,
}

/// Operations the orchestration needs from the repository store.
pub trait StoreClient {
    /// Check that the store is usable before anything is staged.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// Create the repository if absent; a no-op when it already exists.
    fn init(&self, repo: &Path, mode: RepoMode) -> Result<()>;

    /// Commit `request.tree` to `request.branch`, returning the commit id.
    fn commit(&self, request: &CommitRequest<'_>) -> Result<String>;

    /// Regenerate (and sign, when enabled) the repository summary.
    fn refresh_summary(&self, repo: &Path, signing: &Signing) -> Result<()>;
}

impl<T: StoreClient + ?Sized> StoreClient for &T {
    fn preflight(&self) -> Result<()> {
        (**self).preflight()
    }

    fn init(&self, repo: &Path, mode: RepoMode) -> Result<()> {
        (**self).init(repo, mode)
    }

    fn commit(&self, request: &CommitRequest<'_>) -> Result<String> {
        (**self).commit(request)
    }

    fn refresh_summary(&self, repo: &Path, signing: &Signing) -> Result<()> {
        (**self).refresh_summary(repo, signing)
    }
}
