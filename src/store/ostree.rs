//! `StoreClient` backed by the `ostree` and `flatpak` command line tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use super::{CommitRequest, RepoMode, Signing, StoreClient};
use crate::error::{Error, Result};

/// Tool used to regenerate the repository summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryTool {
    /// `flatpak build-update-repo`, which also refreshes appstream data.
    #[default]
    Flatpak,
    /// `ostree summary -u`.
    Ostree,
}

impl FromStr for SummaryTool {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "flatpak" => Ok(Self::Flatpak),
            "ostree" => Ok(Self::Ostree),
            other => Err(Error::Validation(format!(
                "unsupported summary tool '{other}'; expected 'flatpak' or 'ostree'"
            ))),
        }
    }
}

/// Runs the host `ostree`/`flatpak` binaries.
#[derive(Debug, Clone)]
pub struct OstreeCli {
    ostree: PathBuf,
    flatpak: PathBuf,
    summary: SummaryTool,
}

impl Default for OstreeCli {
    fn default() -> Self {
        Self::new(SummaryTool::default())
    }
}

impl OstreeCli {
    pub fn new(summary: SummaryTool) -> Self {
        Self {
            ostree: PathBuf::from("ostree"),
            flatpak: PathBuf::from("flatpak"),
            summary,
        }
    }

    /// Override the binaries that get executed.
    pub fn with_binaries(mut self, ostree: impl Into<PathBuf>, flatpak: impl Into<PathBuf>) -> Self {
        self.ostree = ostree.into();
        self.flatpak = flatpak.into();
        self
    }

    /// Host tools this client needs, as (command, package) pairs.
    pub fn required_tools(&self) -> Vec<(&Path, &'static str)> {
        let mut tools = vec![(self.ostree.as_path(), "ostree")];
        if self.summary == SummaryTool::Flatpak {
            tools.push((self.flatpak.as_path(), "flatpak"));
        }
        tools
    }

    fn run(&self, operation: &'static str, program: &Path, args: &[OsString]) -> Result<String> {
        debug!(program = %program.display(), ?args, "running store command");
        let output = Command::new(program).args(args).output().map_err(|e| {
            Error::commit(
                operation,
                format!("failed to run {}: {e}", program.display()),
            )
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::commit(
            operation,
            format!(
                "{} exited with {}: {}\n{}",
                program.display(),
                output.status,
                stdout.trim(),
                stderr.trim()
            ),
        ))
    }
}

impl StoreClient for OstreeCli {
    /// Fail early, listing every missing tool with the package providing it.
    fn preflight(&self) -> Result<()> {
        let missing: Vec<String> = self
            .required_tools()
            .into_iter()
            .filter(|(tool, _)| which::which(tool).is_err())
            .map(|(tool, package)| format!("  {} (install: {})", tool.display(), package))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::Config(format!(
            "missing required host tools:\n{}",
            missing.join("\n")
        )))
    }

    fn init(&self, repo: &Path, mode: RepoMode) -> Result<()> {
        if repo.join("config").is_file() {
            debug!(repo = %repo.display(), "repository already initialized");
            return Ok(());
        }
        std::fs::create_dir_all(repo).map_err(|e| {
            Error::commit("init", format!("creating '{}': {e}", repo.display()))
        })?;
        self.run("init", &self.ostree, &init_args(repo, mode))?;
        Ok(())
    }

    fn commit(&self, request: &CommitRequest<'_>) -> Result<String> {
        let stdout = self.run("commit", &self.ostree, &commit_args(request))?;
        let commit_id = stdout.trim().to_string();
        if commit_id.is_empty() {
            return Err(Error::commit("commit", "ostree printed no commit checksum"));
        }
        Ok(commit_id)
    }

    fn refresh_summary(&self, repo: &Path, signing: &Signing) -> Result<()> {
        let (program, args) = match self.summary {
            SummaryTool::Flatpak => (&self.flatpak, flatpak_summary_args(repo, signing)),
            SummaryTool::Ostree => (&self.ostree, ostree_summary_args(repo, signing)),
        };
        self.run("summary refresh", program, &args)?;
        Ok(())
    }
}

fn repo_arg(repo: &Path) -> OsString {
    let mut arg = OsString::from("--repo=");
    arg.push(repo);
    arg
}

fn init_args(repo: &Path, mode: RepoMode) -> Vec<OsString> {
    vec![
        "init".into(),
        repo_arg(repo),
        format!("--mode={mode}").into(),
    ]
}

fn commit_args(request: &CommitRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "commit".into(),
        repo_arg(request.repo),
        format!("--owner-uid={}", request.owner_uid).into(),
        format!("--owner-gid={}", request.owner_gid).into(),
    ];
    if request.strip_xattrs {
        args.push("--no-xattrs".into());
    }
    args.push(format!("--branch={}", request.branch).into());
    args.push(format!("--subject={}", request.subject).into());
    args.push(format!("--body={}", request.body).into());
    args.extend(request.signing.args().into_iter().map(OsString::from));
    args.push(request.tree.as_os_str().to_owned());
    args
}

fn flatpak_summary_args(repo: &Path, signing: &Signing) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["build-update-repo".into()];
    args.extend(signing.args().into_iter().map(OsString::from));
    args.push(repo.as_os_str().to_owned());
    args
}

fn ostree_summary_args(repo: &Path, signing: &Signing) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["summary".into(), repo_arg(repo), "-u".into()];
    args.extend(signing.args().into_iter().map(OsString::from));
    args
}
