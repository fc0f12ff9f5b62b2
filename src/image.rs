//! Image identity: type, architecture, version and organization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Known machine names that do not map mechanically onto an architecture.
const ARCH_ALIASES: &[(&str, &str)] = &[("qemux86-64", "x86_64"), ("qemux86", "x86")];

/// Which runtime flavour an image provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Runtime,
    Sdk,
}

impl ImageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Sdk => "sdk",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "runtime" => Ok(Self::Runtime),
            "sdk" => Ok(Self::Sdk),
            other => Err(Error::Validation(format!(
                "unsupported image type '{other}'; expected 'runtime' or 'sdk'"
            ))),
        }
    }
}

/// Identity of the image being committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    image_type: ImageType,
    architecture: String,
    version: String,
    organization: String,
}

impl ImageSpec {
    /// Build a spec, rejecting values that cannot form a branch name.
    ///
    /// The architecture is kept as given (it names the build machine when
    /// resolving build directories) and normalized on demand.
    pub fn new(
        image_type: ImageType,
        architecture: impl Into<String>,
        version: impl Into<String>,
        organization: impl Into<String>,
    ) -> Result<Self> {
        let spec = Self {
            image_type,
            architecture: architecture.into(),
            version: version.into(),
            organization: organization.into(),
        };

        normalize_arch(&spec.architecture)?;
        validate_segment("version", &spec.version)?;
        validate_segment("organization", &spec.organization)?;

        Ok(spec)
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    /// Architecture exactly as supplied (e.g. `qemux86-64`).
    pub fn raw_architecture(&self) -> &str {
        &self.architecture
    }

    /// Canonical architecture token (e.g. `x86_64`).
    pub fn architecture(&self) -> String {
        // Validated in `new`.
        normalize_arch(&self.architecture).unwrap_or_else(|_| self.architecture.clone())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }
}

/// Canonicalize an architecture or machine name.
///
/// Known aliases are looked up first. Anything else loses its `qemu`
/// prefix and has hyphens turned into underscores, so the result is stable
/// under repeated normalization.
pub fn normalize_arch(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if let Some((_, canonical)) = ARCH_ALIASES.iter().find(|(alias, _)| *alias == raw) {
        return Ok((*canonical).to_string());
    }

    let mut stripped = raw;
    while let Some(rest) = stripped.strip_prefix("qemu") {
        stripped = rest;
    }
    let normalized = stripped.replace('-', "_");

    if normalized.is_empty() {
        return Err(Error::Validation(format!(
            "architecture '{raw}' does not name a usable architecture"
        )));
    }
    if normalized.contains('/') || normalized.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "architecture '{raw}' must not contain '/' or whitespace"
        )));
    }

    Ok(normalized)
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    if value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "{field} '{value}' must not contain '/' or whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_aliases() {
        assert_eq!(normalize_arch("qemux86-64").unwrap(), "x86_64");
        assert_eq!(normalize_arch("qemux86").unwrap(), "x86");
    }

    #[test]
    fn test_unknown_arch_is_stripped_and_underscored() {
        assert_eq!(normalize_arch("qemuarm64").unwrap(), "arm64");
        assert_eq!(normalize_arch("intel-corei7-64").unwrap(), "intel_corei7_64");
        assert_eq!(normalize_arch("x86").unwrap(), "x86");
        assert_eq!(normalize_arch("qemuqemumips-le").unwrap(), "mips_le");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for raw in [
            "qemux86-64",
            "qemux86",
            "qemuarm64",
            "intel-corei7-64",
            "x86_64",
            "qemuqemux",
            "riscv64",
        ] {
            let once = normalize_arch(raw).unwrap();
            let twice = normalize_arch(&once).unwrap();
            assert_eq!(once, twice, "normalization of '{raw}' is not stable");
        }
    }

    #[test]
    fn test_empty_arch_rejected() {
        assert!(normalize_arch("").unwrap_err().is_validation());
        assert!(normalize_arch("qemu").unwrap_err().is_validation());
    }

    #[test]
    fn test_image_type_parse() {
        assert_eq!("sdk".parse::<ImageType>().unwrap(), ImageType::Sdk);
        assert_eq!("Runtime".parse::<ImageType>().unwrap(), ImageType::Runtime);
        assert!("platform".parse::<ImageType>().unwrap_err().is_validation());
    }

    #[test]
    fn test_spec_rejects_bad_segments() {
        assert!(ImageSpec::new(ImageType::Sdk, "x86", "", "org.test").is_err());
        assert!(ImageSpec::new(ImageType::Sdk, "x86", "1.0", "org/test").is_err());
        assert!(ImageSpec::new(ImageType::Sdk, "x86", "1 0", "org.test").is_err());
    }

    #[test]
    fn test_spec_keeps_raw_architecture() {
        let spec = ImageSpec::new(ImageType::Runtime, "qemux86-64", "1.0", "org.test").unwrap();
        assert_eq!(spec.raw_architecture(), "qemux86-64");
        assert_eq!(spec.architecture(), "x86_64");
    }
}
