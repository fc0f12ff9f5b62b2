//! Publish Yocto-built OS images as OSTree runtime branches.
//!
//! A finished image (a root filesystem tarball or an unpacked sysroot) is
//! relocated into the layout a runtime expects, given a `metadata` file, and
//! committed to a versioned branch of an OSTree repository:
//!
//! ```text
//! runtime/<org>.<Role>/<arch>/<version>
//!
//! image-commit
//!     │
//!     ├── config      TOML file + command line ─► PublishConfig
//!     ├── source      tarball / sysroot / build-dir lookup
//!     ├── relocate    path rewriting into a staging tree
//!     ├── metadata    file, template or synthesized default
//!     ├── branch      branch naming and arch normalization
//!     ├── libraries   optional shared-library manifest
//!     ├── staging     per-run scratch trees with stale-run sweeping
//!     ├── store       StoreClient trait + ostree/flatpak CLI client
//!     └── publish     orchestration of all of the above
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_commit::{publish, ConfigFile, OstreeCli, Overrides, PublishConfig};
//!
//! let config = PublishConfig::build(ConfigFile::default(), Overrides {
//!     repo: Some("/srv/repo".into()),
//!     image: Some("core-image-flatpak-sdk.tar.bz2".into()),
//!     architecture: Some("qemux86-64".into()),
//!     version: Some("1.2.3".into()),
//!     image_type: Some("sdk".into()),
//!     ..Default::default()
//! })?;
//! let store = OstreeCli::new(config.summary);
//! let outcome = publish(&config, &store)?;
//! assert_eq!(outcome.commit.branch.as_str(), "runtime/org.yocto.BaseSdk/x86_64/1.2.3");
//! ```

pub mod branch;
pub mod config;
pub mod error;
pub mod image;
pub mod libraries;
pub mod metadata;
pub mod publish;
pub mod relocate;
pub mod source;
pub mod staging;
pub mod store;

pub use branch::{compute_branch, BranchId, RoleName};
pub use config::{ConfigFile, Overrides, PublishConfig};
pub use error::{Error, Result};
pub use image::{normalize_arch, ImageSpec, ImageType};
pub use publish::{commit, publish, CommitResult, PublishOutcome};
pub use store::{CommitRequest, OstreeCli, RepoMode, Signing, StoreClient, SummaryTool};
