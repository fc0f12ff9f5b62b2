//! Ordered path rewrite rules.
//!
//! Pure path arithmetic; the filesystem side lives in the parent module.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One prefix rewrite, matched component-wise against relative paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRule {
    pub from: PathBuf,
    pub to: PathBuf,
    /// When false a match keeps the entry at its original path.
    #[serde(default = "default_substitute")]
    pub substitute: bool,
}

fn default_substitute() -> bool {
    true
}

impl RewriteRule {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            substitute: true,
        }
    }

    /// Match `from` without rewriting.
    pub fn keep(from: impl Into<PathBuf>) -> Self {
        let from = from.into();
        Self {
            to: from.clone(),
            from,
            substitute: false,
        }
    }

    fn apply(&self, path: &Path) -> Option<PathBuf> {
        let rest = path.strip_prefix(&self.from).ok()?;
        if !self.substitute {
            return Some(path.to_path_buf());
        }
        if rest.as_os_str().is_empty() {
            Some(self.to.clone())
        } else {
            Some(self.to.join(rest))
        }
    }
}

/// What happens to entries no rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Unmatched {
    #[default]
    Exclude,
    PassThrough,
    /// Keep only entries whose top-level component is listed.
    AllowList(Vec<String>),
}

/// Ordered rules plus the policy for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub rules: Vec<RewriteRule>,
    pub unmatched: Unmatched,
}

impl Default for PathMapping {
    /// `usr` → `files`, `etc` → `files/etc`, everything else dropped.
    fn default() -> Self {
        Self {
            rules: vec![RewriteRule::new("usr", "files"), RewriteRule::new("etc", "files/etc")],
            unmatched: Unmatched::Exclude,
        }
    }
}

impl PathMapping {
    /// Destination for a clean relative path, `None` when excluded.
    pub fn map(&self, path: &Path) -> Option<PathBuf> {
        if let Some(mapped) = self.rules.iter().find_map(|rule| rule.apply(path)) {
            return Some(mapped);
        }

        match &self.unmatched {
            Unmatched::Exclude => None,
            Unmatched::PassThrough => Some(path.to_path_buf()),
            Unmatched::AllowList(allowed) => {
                let top = path.components().next()?.as_os_str().to_str()?;
                allowed
                    .iter()
                    .any(|name| name == top)
                    .then(|| path.to_path_buf())
            }
        }
    }

    /// Whether anything below directory `path` could be kept.
    ///
    /// Lets the tree walker skip excluded subtrees without descending.
    pub fn may_contain(&self, path: &Path) -> bool {
        if self.map(path).is_some() {
            return true;
        }
        self.rules.iter().any(|rule| rule.from.starts_with(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(mapping: &PathMapping, path: &str) -> Option<String> {
        mapping
            .map(Path::new(path))
            .map(|p| p.to_string_lossy().into_owned())
    }

    #[test]
    fn test_default_mapping() {
        let mapping = PathMapping::default();
        assert_eq!(map(&mapping, "usr"), Some("files".into()));
        assert_eq!(map(&mapping, "usr/bin/sh"), Some("files/bin/sh".into()));
        assert_eq!(map(&mapping, "etc/hosts"), Some("files/etc/hosts".into()));
        assert_eq!(map(&mapping, "var/log/messages"), None);
        assert_eq!(map(&mapping, "boot"), None);
    }

    #[test]
    fn test_prefix_is_component_wise() {
        let mapping = PathMapping::default();
        assert_eq!(map(&mapping, "usrlocal/bin"), None);
        assert_eq!(map(&mapping, "etcetera"), None);
    }

    #[test]
    fn test_first_match_wins() {
        let mapping = PathMapping {
            rules: vec![
                RewriteRule::new("usr/share", "share"),
                RewriteRule::new("usr", "files"),
            ],
            unmatched: Unmatched::Exclude,
        };
        assert_eq!(map(&mapping, "usr/share/doc"), Some("share/doc".into()));
        assert_eq!(map(&mapping, "usr/lib/libc.so.6"), Some("files/lib/libc.so.6".into()));
    }

    #[test]
    fn test_keep_rule() {
        let mapping = PathMapping {
            rules: vec![RewriteRule::keep("opt")],
            unmatched: Unmatched::Exclude,
        };
        assert_eq!(map(&mapping, "opt/app"), Some("opt/app".into()));
        assert_eq!(map(&mapping, "srv"), None);
    }

    #[test]
    fn test_unmatched_policies() {
        let pass = PathMapping {
            rules: vec![RewriteRule::new("usr", "files")],
            unmatched: Unmatched::PassThrough,
        };
        assert_eq!(map(&pass, "var/lib/x"), Some("var/lib/x".into()));

        let allow = PathMapping {
            rules: vec![RewriteRule::new("usr", "files")],
            unmatched: Unmatched::AllowList(vec!["etc".into()]),
        };
        assert_eq!(map(&allow, "etc/passwd"), Some("etc/passwd".into()));
        assert_eq!(map(&allow, "var/lib/x"), None);
    }

    #[test]
    fn test_may_contain() {
        let mapping = PathMapping {
            rules: vec![RewriteRule::new("usr/share", "share")],
            unmatched: Unmatched::Exclude,
        };
        assert!(mapping.may_contain(Path::new("usr")));
        assert!(mapping.may_contain(Path::new("usr/share/doc")));
        assert!(!mapping.may_contain(Path::new("usr/lib")));
        assert!(!mapping.may_contain(Path::new("var")));
    }
}
