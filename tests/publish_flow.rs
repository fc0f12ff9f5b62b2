use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use walkdir::WalkDir;

use image_commit::store::{CommitRequest, RepoMode, Signing, StoreClient};
use image_commit::{publish, ConfigFile, Overrides, PublishConfig, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Init(PathBuf, RepoMode),
    Commit { branch: String, subject: String, signed: bool },
    Summary { signed: bool },
}

/// In-memory store that records calls and hashes the tree it is given.
#[derive(Default)]
struct FakeStore {
    calls: RefCell<Vec<Call>>,
    fail_commit: bool,
    missing_tools: bool,
    committed_metadata: RefCell<Option<String>>,
    committed_paths: RefCell<Vec<String>>,
}

impl FakeStore {
    fn failing() -> Self {
        Self {
            fail_commit: true,
            ..Default::default()
        }
    }

    fn without_tools() -> Self {
        Self {
            missing_tools: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }
}

impl StoreClient for FakeStore {
    fn preflight(&self) -> Result<()> {
        if self.missing_tools {
            return Err(image_commit::Error::Config("missing required host tools: ostree".into()));
        }
        Ok(())
    }

    fn init(&self, repo: &Path, mode: RepoMode) -> Result<()> {
        self.calls.borrow_mut().push(Call::Init(repo.to_path_buf(), mode));
        Ok(())
    }

    fn commit(&self, request: &CommitRequest<'_>) -> Result<String> {
        self.calls.borrow_mut().push(Call::Commit {
            branch: request.branch.to_string(),
            subject: request.subject.to_string(),
            signed: request.signing.is_enabled(),
        });
        if self.fail_commit {
            return Err(image_commit::Error::Commit {
                operation: "commit",
                message: "store rejected the tree".into(),
            });
        }

        *self.committed_metadata.borrow_mut() =
            fs::read_to_string(request.tree.join("metadata")).ok();

        let mut hasher = Sha256::new();
        let mut paths = Vec::new();
        for entry in WalkDir::new(request.tree).min_depth(1).sort_by_file_name() {
            let entry = entry.unwrap();
            let rel = entry
                .path()
                .strip_prefix(request.tree)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            hasher.update(rel.as_bytes());
            if entry.file_type().is_file() {
                hasher.update(fs::read(entry.path()).unwrap());
            }
            paths.push(rel);
        }
        *self.committed_paths.borrow_mut() = paths;
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn refresh_summary(&self, _repo: &Path, signing: &Signing) -> Result<()> {
        self.calls.borrow_mut().push(Call::Summary {
            signed: signing.is_enabled(),
        });
        Ok(())
    }
}

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("sysroot");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("var/log")).unwrap();
        fs::write(root.join("usr/bin/sh"), b"#!shell\n").unwrap();
        fs::write(root.join("usr/lib/libc.so.6"), b"elf").unwrap();
        fs::write(root.join("etc/os-release"), b"ID=poky\n").unwrap();
        fs::write(root.join("var/log/boot.log"), b"noise").unwrap();
        Self { temp }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    fn overrides(&self, image_type: &str) -> Overrides {
        Overrides {
            repo: Some(self.path("repo")),
            sysroot: Some(self.path("sysroot")),
            architecture: Some("qemux86-64".into()),
            version: Some("1.2.3".into()),
            image_type: Some(image_type.into()),
            organization: Some("test.org".into()),
            work_dir: Some(self.path("work")),
            ..Default::default()
        }
    }

    fn config(&self, overrides: Overrides) -> PublishConfig {
        PublishConfig::build(ConfigFile::default(), overrides).unwrap()
    }

    fn work_entries(&self) -> Vec<String> {
        match fs::read_dir(self.path("work")) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[test]
fn test_sdk_publish_end_to_end() {
    let fixture = Fixture::new();
    let config = fixture.config(fixture.overrides("sdk"));
    let store = FakeStore::default();

    let outcome = publish(&config, &store).unwrap();

    assert_eq!(
        outcome.commit.branch.as_str(),
        "runtime/test.org.BaseSdk/x86_64/1.2.3"
    );
    assert_eq!(outcome.commit.subject, "sdk 1.2.3");
    assert_eq!(outcome.commit.commit_id.len(), 64);
    assert_eq!(
        store.calls(),
        vec![
            Call::Init(fixture.path("repo"), RepoMode::ArchiveZ2),
            Call::Commit {
                branch: "runtime/test.org.BaseSdk/x86_64/1.2.3".into(),
                subject: "sdk 1.2.3".into(),
                signed: false,
            },
            Call::Summary { signed: false },
        ]
    );

    let paths = store.committed_paths.borrow().clone();
    assert!(paths.contains(&"files/bin/sh".to_string()));
    assert!(paths.contains(&"files/etc/os-release".to_string()));
    assert!(paths.contains(&"metadata".to_string()));
    assert!(!paths.iter().any(|p| p.starts_with("var") || p.starts_with("usr")));
    assert_eq!(outcome.relocation.excluded, 1);

    assert!(fixture.work_entries().is_empty(), "staging left behind");
}

#[test]
fn test_runtime_branch_and_metadata_at_commit_time() {
    let fixture = Fixture::new();
    let mut overrides = fixture.overrides("runtime");
    overrides.architecture = Some("qemux86".into());
    let config = fixture.config(overrides);
    let store = FakeStore::default();

    let outcome = publish(&config, &store).unwrap();

    assert_eq!(
        outcome.commit.branch.as_str(),
        "runtime/test.org.BasePlatform/x86/1.2.3"
    );
    let metadata = store.committed_metadata.borrow().clone().unwrap();
    assert!(metadata.starts_with("[Runtime]\n"));
    assert!(metadata.contains("name=test.org.BasePlatform\n"));
    assert!(metadata.contains("sdk=test.org.BaseSdk/x86/1.2.3\n"));
}

#[test]
fn test_template_metadata_is_substituted() {
    let fixture = Fixture::new();
    let template = fixture.path("metadata.in");
    fs::write(&template, "[Runtime]\narch=@ARCH@\nversion=@VERSION@\n").unwrap();
    let mut overrides = fixture.overrides("sdk");
    overrides.metadata_template = Some(template);
    let store = FakeStore::default();

    publish(&fixture.config(overrides), &store).unwrap();

    assert_eq!(
        store.committed_metadata.borrow().as_deref(),
        Some("[Runtime]\narch=x86_64\nversion=1.2.3\n")
    );
}

#[test]
fn test_commit_failure_skips_summary_and_cleans_up() {
    let fixture = Fixture::new();
    let config = fixture.config(fixture.overrides("sdk"));
    let store = FakeStore::failing();

    let err = publish(&config, &store).unwrap_err();

    assert!(err.is_commit());
    assert!(!store
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Summary { .. })));
    assert!(fixture.work_entries().is_empty(), "staging left behind");
}

#[test]
fn test_missing_metadata_fails_before_staging() {
    let fixture = Fixture::new();
    let mut overrides = fixture.overrides("sdk");
    overrides.no_default_metadata = true;
    overrides.metadata_template = Some(fixture.path("absent.in"));
    let store = FakeStore::default();

    let err = publish(&fixture.config(overrides), &store).unwrap_err();

    assert!(err.is_config());
    assert!(err.to_string().contains("absent.in"));
    assert!(store.calls().is_empty());
    assert!(!fixture.path("work").exists());
}

#[test]
fn test_missing_metadata_reported_before_store_preflight() {
    let fixture = Fixture::new();
    let mut overrides = fixture.overrides("sdk");
    overrides.no_default_metadata = true;
    let store = FakeStore::without_tools();

    let err = publish(&fixture.config(overrides), &store).unwrap_err();

    assert!(err.to_string().contains("no metadata source available"), "{err}");
}

#[test]
fn test_preflight_failure_leaves_work_dir_untouched() {
    let fixture = Fixture::new();
    let store = FakeStore::without_tools();

    let err = publish(&fixture.config(fixture.overrides("sdk")), &store).unwrap_err();

    assert!(err.is_config());
    assert!(err.to_string().contains("host tools"));
    assert!(store.calls().is_empty());
    assert!(!fixture.path("work").exists());
}

#[test]
fn test_signing_reaches_commit_and_summary() {
    let fixture = Fixture::new();
    let mut overrides = fixture.overrides("sdk");
    overrides.gpg_key = Some("ABCD".into());
    overrides.gpg_home = Some(fixture.path("gnupg"));
    let store = FakeStore::default();

    publish(&fixture.config(overrides), &store).unwrap();

    let calls = store.calls();
    assert!(matches!(calls[1], Call::Commit { signed: true, .. }));
    assert_eq!(calls[2], Call::Summary { signed: true });
}

#[test]
fn test_library_manifest_written_when_requested() {
    let fixture = Fixture::new();
    let manifest = fixture.path("out/libs.txt");
    let mut overrides = fixture.overrides("sdk");
    overrides.library_manifest = Some(manifest.clone());
    let store = FakeStore::default();

    let outcome = publish(&fixture.config(overrides), &store).unwrap();

    assert_eq!(outcome.libraries, Some(1));
    assert_eq!(fs::read_to_string(manifest).unwrap(), "/usr/lib/libc.so.6\n");
}

#[test]
fn test_library_manifest_skipped_by_default() {
    let fixture = Fixture::new();
    let store = FakeStore::default();

    let outcome = publish(&fixture.config(fixture.overrides("sdk")), &store).unwrap();

    assert_eq!(outcome.libraries, None);
}

#[test]
fn test_stale_staging_is_swept() {
    let fixture = Fixture::new();
    let stale = fixture.path("work/run-1-1");
    fs::create_dir_all(stale.join("tree/files")).unwrap();
    fs::write(fixture.path("work/run-1-1.lock"), b"").unwrap();
    let store = FakeStore::default();

    publish(&fixture.config(fixture.overrides("sdk")), &store).unwrap();

    assert!(fixture.work_entries().is_empty());
}

#[test]
fn test_record_written() {
    let fixture = Fixture::new();
    let record = fixture.path("record.json");
    let mut overrides = fixture.overrides("sdk");
    overrides.record = Some(record.clone());
    let store = FakeStore::default();

    let outcome = publish(&fixture.config(overrides), &store).unwrap();

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(record).unwrap()).unwrap();
    assert_eq!(json["branch"], "runtime/test.org.BaseSdk/x86_64/1.2.3");
    assert_eq!(json["commit_id"], outcome.commit.commit_id.as_str());
    assert_eq!(json["subject"], "sdk 1.2.3");
}
