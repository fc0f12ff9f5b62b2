//! Image sources: tarballs, sysroot directories and build directories.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};
use crate::image::ImageSpec;

/// Compression wrapped around a tar archive, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// Detect compression from a tarball file name, `None` if not a tarball.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        let table: &[(&str, Compression)] = &[
            (".tar.gz", Self::Gzip),
            (".tgz", Self::Gzip),
            (".tar.bz2", Self::Bzip2),
            (".tbz2", Self::Bzip2),
            (".tar.xz", Self::Xz),
            (".txz", Self::Xz),
            (".tar.zst", Self::Zstd),
            (".tar", Self::None),
        ];
        table
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix))
            .map(|(_, compression)| *compression)
    }
}

/// An OS image to relocate or scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A (possibly compressed) tar archive of the image root.
    Tarball(PathBuf),
    /// An unpacked image root directory.
    Sysroot(PathBuf),
}

impl ImageSource {
    /// Pick the image source from the three mutually exclusive inputs.
    pub fn resolve(
        tarball: Option<&Path>,
        sysroot: Option<&Path>,
        build_dir: Option<&Path>,
        spec: &ImageSpec,
    ) -> Result<Self> {
        let given = [tarball.is_some(), sysroot.is_some(), build_dir.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if given != 1 {
            return Err(Error::Config(format!(
                "exactly one image source is required (tarball, sysroot or build directory); got {given}"
            )));
        }

        if let Some(tarball) = tarball {
            if !tarball.is_file() {
                return Err(Error::Config(format!(
                    "image tarball not found: {}",
                    tarball.display()
                )));
            }
            if Compression::detect(tarball).is_none() {
                return Err(Error::Config(format!(
                    "unsupported image archive '{}'; expected .tar, .tar.gz, .tar.bz2, .tar.xz or .tar.zst",
                    tarball.display()
                )));
            }
            return Ok(Self::Tarball(tarball.to_path_buf()));
        }

        if let Some(sysroot) = sysroot {
            if !sysroot.is_dir() {
                return Err(Error::Config(format!(
                    "image sysroot is not a directory: {}",
                    sysroot.display()
                )));
            }
            return Ok(Self::Sysroot(sysroot.to_path_buf()));
        }

        match build_dir {
            Some(build_dir) => find_deployed_image(build_dir, spec).map(Self::Tarball),
            None => unreachable!("counted above"),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Tarball(path) | Self::Sysroot(path) => path,
        }
    }
}

/// Open a tarball with the decoder its extension asks for.
pub fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let compression = Compression::detect(path).ok_or_else(|| {
        Error::Config(format!("not a recognised tarball: {}", path.display()))
    })?;
    let file = BufReader::new(File::open(path).at(path)?);

    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file).at(path)?),
    };

    Ok(tar::Archive::new(reader))
}

/// Turn an archive or tree path into a clean relative path.
///
/// `./` and leading `/` are dropped. Returns `Ok(None)` for the image root
/// itself and an error for paths that climb out with `..`.
pub fn clean_relative(path: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(path.display().to_string()));
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

/// Locate the deployed `flatpak-<type>` tarball for the image's build machine.
///
/// Looks under `<build_dir>/tmp*/deploy/images/<machine>/`. Symlinks that
/// point at the same file count once; any other ambiguity is an error.
fn find_deployed_image(build_dir: &Path, spec: &ImageSpec) -> Result<PathBuf> {
    if !build_dir.is_dir() {
        return Err(Error::Config(format!(
            "build directory not found: {}",
            build_dir.display()
        )));
    }

    let marker = format!("flatpak-{}", spec.image_type());
    let machine = spec.raw_architecture();
    let mut candidates: Vec<(PathBuf, PathBuf)> = Vec::new();

    for tmp in fs::read_dir(build_dir).at(build_dir)? {
        let tmp = tmp.at(build_dir)?.path();
        let is_tmp = tmp
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("tmp"));
        if !is_tmp {
            continue;
        }

        let deploy = tmp.join("deploy/images").join(machine);
        if !deploy.is_dir() {
            continue;
        }

        for entry in WalkDir::new(&deploy).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| walk_error(&deploy, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.contains(&marker) || Compression::detect(path).is_none() {
                continue;
            }
            let canonical = fs::canonicalize(path).at(path)?;
            if !candidates.iter().any(|(_, seen)| *seen == canonical) {
                candidates.push((path.to_path_buf(), canonical));
            }
        }
    }

    candidates.sort();
    match candidates.as_slice() {
        [] => Err(Error::Config(format!(
            "no '{}' image tarball for machine '{}' under {}",
            marker,
            machine,
            build_dir.display()
        ))),
        [(path, _)] => Ok(path.clone()),
        many => Err(Error::Config(format!(
            "ambiguous image source under {}; candidates: {}",
            build_dir.display(),
            many.iter()
                .map(|(path, _)| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

pub(crate) fn walk_error(root: &Path, err: walkdir::Error) -> Error {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    Error::io(path, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageType;
    use tempfile::TempDir;

    fn spec(image_type: ImageType) -> ImageSpec {
        ImageSpec::new(image_type, "qemux86-64", "1.0", "org.test").unwrap()
    }

    #[test]
    fn test_detect_compression() {
        assert_eq!(Compression::detect(Path::new("a.tar")), Some(Compression::None));
        assert_eq!(Compression::detect(Path::new("a.tar.gz")), Some(Compression::Gzip));
        assert_eq!(Compression::detect(Path::new("a.TAR.BZ2")), Some(Compression::Bzip2));
        assert_eq!(Compression::detect(Path::new("a.tar.xz")), Some(Compression::Xz));
        assert_eq!(Compression::detect(Path::new("a.tar.zst")), Some(Compression::Zstd));
        assert_eq!(Compression::detect(Path::new("a.img")), None);
    }

    #[test]
    fn test_clean_relative() {
        assert_eq!(
            clean_relative(Path::new("./usr/bin/sh")).unwrap(),
            Some(PathBuf::from("usr/bin/sh"))
        );
        assert_eq!(
            clean_relative(Path::new("/etc/hosts")).unwrap(),
            Some(PathBuf::from("etc/hosts"))
        );
        assert_eq!(clean_relative(Path::new("./")).unwrap(), None);
        assert!(clean_relative(Path::new("usr/../../etc")).is_err());
    }

    #[test]
    fn test_requires_exactly_one_source() {
        let temp = TempDir::new().unwrap();
        let err = ImageSource::resolve(None, None, None, &spec(ImageType::Sdk)).unwrap_err();
        assert!(err.is_config());

        let err = ImageSource::resolve(
            Some(Path::new("a.tar")),
            Some(temp.path()),
            None,
            &spec(ImageType::Sdk),
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_sysroot_source() {
        let temp = TempDir::new().unwrap();
        let source =
            ImageSource::resolve(None, Some(temp.path()), None, &spec(ImageType::Sdk)).unwrap();
        assert_eq!(source, ImageSource::Sysroot(temp.path().to_path_buf()));
    }

    #[test]
    fn test_build_dir_lookup() {
        let temp = TempDir::new().unwrap();
        let deploy = temp.path().join("tmp-glibc/deploy/images/qemux86-64");
        fs::create_dir_all(&deploy).unwrap();
        let sdk = deploy.join("core-image-flatpak-sdk-qemux86-64-20240101.tar.bz2");
        fs::write(&sdk, b"").unwrap();
        std::os::unix::fs::symlink(
            sdk.file_name().unwrap(),
            deploy.join("core-image-flatpak-sdk-qemux86-64.tar.bz2"),
        )
        .unwrap();
        fs::write(deploy.join("core-image-flatpak-runtime-qemux86-64.tar.bz2"), b"x").unwrap();
        fs::write(deploy.join("core-image-flatpak-sdk-qemux86-64.manifest"), b"").unwrap();

        let source =
            ImageSource::resolve(None, None, Some(temp.path()), &spec(ImageType::Sdk)).unwrap();
        let ImageSource::Tarball(found) = source else {
            panic!("expected tarball source");
        };
        assert_eq!(fs::canonicalize(found).unwrap(), fs::canonicalize(&sdk).unwrap());
    }

    #[test]
    fn test_build_dir_ambiguous() {
        let temp = TempDir::new().unwrap();
        let deploy = temp.path().join("tmp/deploy/images/qemux86-64");
        fs::create_dir_all(&deploy).unwrap();
        fs::write(deploy.join("a-flatpak-runtime-qemux86-64.tar.gz"), b"1").unwrap();
        fs::write(deploy.join("b-flatpak-runtime-qemux86-64.tar.gz"), b"2").unwrap();

        let err = ImageSource::resolve(None, None, Some(temp.path()), &spec(ImageType::Runtime))
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_build_dir_missing_image() {
        let temp = TempDir::new().unwrap();
        let err = ImageSource::resolve(None, None, Some(temp.path()), &spec(ImageType::Sdk))
            .unwrap_err();
        assert!(err.is_config());
    }
}
