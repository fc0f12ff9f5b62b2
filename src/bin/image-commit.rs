//! `image-commit`: publish a Yocto image as an OSTree runtime branch.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use image_commit::{publish, ConfigFile, OstreeCli, Overrides, PublishConfig};

/// Relocate an OS image into a runtime tree and commit it to
/// `runtime/<org>.<Role>/<arch>/<version>` in an OSTree repository.
#[derive(Parser, Debug)]
#[command(name = "image-commit", disable_version_flag = true, about, long_about = None)]
struct Cli {
    /// OSTree repository to commit into (created when missing).
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Root filesystem tarball (.tar, .tar.gz, .tar.bz2, .tar.xz, .tar.zst).
    #[arg(long, conflicts_with_all = ["sysroot", "build_dir"])]
    image: Option<PathBuf>,

    /// Unpacked root filesystem directory.
    #[arg(long, conflicts_with = "build_dir")]
    sysroot: Option<PathBuf>,

    /// Yocto build directory; the image is looked up under tmp*/deploy/images.
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// Target architecture or machine name, e.g. x86_64 or qemux86-64.
    #[arg(long = "arch")]
    architecture: Option<String>,

    /// Image version used in the branch name.
    #[arg(long)]
    version: Option<String>,

    /// Image type: sdk or runtime.
    #[arg(long = "type")]
    image_type: Option<String>,

    /// Organization id prefix of the runtime name.
    #[arg(long = "org")]
    organization: Option<String>,

    /// Metadata file copied verbatim into the tree.
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Metadata template with @ARCH@ and @VERSION@ placeholders.
    #[arg(long)]
    metadata_template: Option<PathBuf>,

    /// Fail instead of synthesizing metadata when no file or template exists.
    #[arg(long)]
    no_default_metadata: bool,

    /// Write the shared-library manifest of the image to FILE.
    #[arg(long = "libs", value_name = "FILE")]
    library_manifest: Option<PathBuf>,

    /// GPG home directory used for signing.
    #[arg(long)]
    gpg_home: Option<PathBuf>,

    /// GPG key id; enables signing of the commit and the summary.
    #[arg(long)]
    gpg_key: Option<String>,

    /// Directory that holds per-run staging trees.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Summary tool: flatpak or ostree.
    #[arg(long)]
    summary: Option<String>,

    /// Write a JSON record of the commit to FILE.
    #[arg(long, value_name = "FILE")]
    record: Option<PathBuf>,

    /// More diagnostics on stderr (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            repo: self.repo.clone(),
            image: self.image.clone(),
            sysroot: self.sysroot.clone(),
            build_dir: self.build_dir.clone(),
            architecture: self.architecture.clone(),
            version: self.version.clone(),
            image_type: self.image_type.clone(),
            organization: self.organization.clone(),
            metadata: self.metadata.clone(),
            metadata_template: self.metadata_template.clone(),
            no_default_metadata: self.no_default_metadata,
            library_manifest: self.library_manifest.clone(),
            gpg_home: self.gpg_home.clone(),
            gpg_key: self.gpg_key.clone(),
            work_dir: self.work_dir.clone(),
            summary: self.summary.clone(),
            record: self.record.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)
            .with_context(|| format!("loading config '{}'", path.display()))?,
        None => ConfigFile::default(),
    };
    let config = PublishConfig::build(file, cli.overrides()).context("invalid arguments")?;

    let store = OstreeCli::new(config.summary);

    let outcome = publish(&config, &store).with_context(|| {
        format!(
            "publishing {} {} to '{}'",
            config.spec.image_type(),
            config.spec.version(),
            config.repo.display()
        )
    })?;

    tracing::info!(
        files = outcome.relocation.files,
        directories = outcome.relocation.directories,
        symlinks = outcome.relocation.symlinks,
        excluded = outcome.relocation.excluded,
        "relocation finished"
    );
    if let Some(count) = outcome.libraries {
        println!("[image-commit] {count} shared libraries listed");
    }
    println!("[image-commit] {} {}", outcome.commit.branch, outcome.commit.commit_id);
    Ok(())
}
