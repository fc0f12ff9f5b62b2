//! Branch naming for committed runtime images.

use std::fmt;

use serde::Serialize;

use crate::error::Result;
use crate::image::{normalize_arch, ImageSpec, ImageType};

/// Role of a runtime in the `<org>.<Role>` application id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleName {
    BasePlatform,
    BaseSdk,
}

impl RoleName {
    pub fn for_type(image_type: ImageType) -> Self {
        match image_type {
            ImageType::Sdk => Self::BaseSdk,
            ImageType::Runtime => Self::BasePlatform,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BasePlatform => "BasePlatform",
            Self::BaseSdk => "BaseSdk",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully-qualified ref, e.g. `runtime/org.yocto.BaseSdk/x86_64/1.2.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BranchId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `<org>.<Role>` for the given role.
pub fn runtime_id(organization: &str, role: RoleName) -> String {
    format!("{organization}.{role}")
}

/// `<org>.<Role>/<arch>/<version>`, the coordinates used inside metadata.
pub fn runtime_ref(spec: &ImageSpec, role: RoleName) -> Result<String> {
    let arch = normalize_arch(spec.raw_architecture())?;
    Ok(format!(
        "{}/{}/{}",
        runtime_id(spec.organization(), role),
        arch,
        spec.version()
    ))
}

/// Derive the branch an image is committed to.
pub fn compute_branch(spec: &ImageSpec) -> Result<BranchId> {
    let role = RoleName::for_type(spec.image_type());
    Ok(BranchId(format!("runtime/{}", runtime_ref(spec, role)?)))
}
