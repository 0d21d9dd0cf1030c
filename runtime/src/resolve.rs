//! Package resolution.
//!
//! Turning package names into a file tree is delegated to a
//! `PackageResolver`. `LocalResolver` handles repositories that are plain
//! directories laid out as `<repo>/<arch>/<package>/`, each package directory
//! holding the files it installs and an optional `.PKGINFO`.

use std::fs;
use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};
use stratum_core::{Architecture, ImageContents};
use walkdir::WalkDir;

use crate::sbom::SbomComponent;

const PKGINFO: &str = ".PKGINFO";
const KEYS_DIR: &str = "etc/apk/keys";
const WORLD_FILE: &str = "etc/apk/world";
const REPOSITORIES_FILE: &str = "etc/apk/repositories";

// Modes of the files and directories the resolver creates itself. They end up
// in layer headers, so they must not depend on the process umask.
const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// A package installed into a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Option<String>,
    /// Repository the package was taken from
    pub repository: String,
    pub architecture: Architecture,
    /// Source package this one was built from; the package name if unknown
    pub origin: String,
    /// Paths the package installed, relative to the tree root, `/`-separated
    pub files: Vec<String>,
}

impl InstalledPackage {
    pub fn to_component(&self) -> SbomComponent {
        SbomComponent {
            name: self.name.clone(),
            version: self.version.clone(),
            source: Some(self.repository.clone()),
        }
    }
}

/// Installs the packages of an image into a directory.
///
/// Called once per architecture, possibly from several threads at once.
pub trait PackageResolver: Send + Sync {
    fn resolve(
        &self,
        contents: &ImageContents,
        arch: Architecture,
        root: &Path,
    ) -> Result<Vec<InstalledPackage>>;
}

/// Resolves packages from local directory repositories.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResolver;

impl LocalResolver {
    pub fn new() -> Self {
        Self
    }

    fn find_package(
        contents: &ImageContents,
        arch: Architecture,
        name: &str,
    ) -> Option<(String, PathBuf)> {
        contents
            .build_repositories
            .iter()
            .chain(&contents.repositories)
            .map(|repo| {
                let dir = repository_dir(repo).join(arch.apk_name()).join(name);
                (repo.clone(), dir)
            })
            .find(|(_, dir)| dir.is_dir())
    }
}

impl PackageResolver for LocalResolver {
    fn resolve(
        &self,
        contents: &ImageContents,
        arch: Architecture,
        root: &Path,
    ) -> Result<Vec<InstalledPackage>> {
        install_keyring(&contents.keyring, root)?;

        let mut installed = Vec::with_capacity(contents.packages.len());
        for name in &contents.packages {
            let (repository, dir) = Self::find_package(contents, arch, name).ok_or_else(|| {
                BuildError::ConfigurationError(format!(
                    "package '{}' not found for {} in any repository",
                    name, arch
                ))
            })?;
            let files = copy_package(&dir, root)?;
            let info = read_pkginfo(&dir)?;
            tracing::debug!(arch = %arch, package = %name, repository = %repository, files = files.len(), "Installed package");
            installed.push(InstalledPackage {
                name: name.clone(),
                version: info.version,
                repository,
                architecture: arch,
                origin: info.origin.unwrap_or_else(|| name.clone()),
                files,
            });
        }

        let mut world: Vec<&str> = contents.packages.iter().map(String::as_str).collect();
        world.sort_unstable();
        write_lines(root, &root.join(WORLD_FILE), &world)?;
        let repositories: Vec<&str> = contents.repositories.iter().map(String::as_str).collect();
        write_lines(root, &root.join(REPOSITORIES_FILE), &repositories)?;

        tracing::info!(arch = %arch, packages = installed.len(), "Resolved packages");
        Ok(installed)
    }
}

fn repository_dir(repo: &str) -> PathBuf {
    PathBuf::from(repo.strip_prefix("file://").unwrap_or(repo))
}

fn install_keyring(keys: &[String], root: &Path) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let dir = root.join(KEYS_DIR);
    create_dirs(root, &dir)?;
    for key in keys {
        let source = repository_dir(key);
        let file_name = source
            .file_name()
            .ok_or_else(|| BuildError::ConfigurationError(format!("keyring entry '{}' is not a file", key)))?;
        let dest = dir.join(file_name);
        fs::copy(&source, &dest)
            .map_err(|e| BuildError::io(format!("installing key {}", source.display()), e))?;
        set_mode(&dest, FILE_MODE)?;
    }
    Ok(())
}

/// Create `dir` and any missing parents below `root` with `DIR_MODE`.
/// Directories that already exist keep their mode.
fn create_dirs(root: &Path, dir: &Path) -> Result<()> {
    let relative = dir
        .strip_prefix(root)
        .map_err(|_| BuildError::malformed(dir.display().to_string(), "outside tree root"))?;
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if current.symlink_metadata().is_ok() {
            continue;
        }
        fs::create_dir(&current)
            .map_err(|e| BuildError::io(format!("creating {}", current.display()), e))?;
        set_mode(&current, DIR_MODE)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| BuildError::io(format!("setting permissions of {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Copy a package directory into `root`, returning the installed paths.
fn copy_package(package: &Path, root: &Path) -> Result<Vec<String>> {
    let mut installed = Vec::new();
    for item in WalkDir::new(package).min_depth(1).follow_links(false) {
        let item = item.map_err(|e| {
            let context = format!("walking {}", package.display());
            match e.into_io_error() {
                Some(io) => BuildError::io(context, io),
                None => BuildError::ConfigurationError(format!("{}: filesystem loop", context)),
            }
        })?;
        let relative = item
            .path()
            .strip_prefix(package)
            .map_err(|_| BuildError::malformed(item.path().display().to_string(), "outside package"))?;
        if relative == Path::new(PKGINFO) {
            continue;
        }

        let dest = root.join(relative);
        let file_type = item.file_type();
        if file_type.is_dir() {
            create_dirs(root, &dest)?;
            let permissions = fs::metadata(item.path())
                .map_err(|e| BuildError::io(format!("reading metadata of {}", item.path().display()), e))?
                .permissions();
            fs::set_permissions(&dest, permissions)
                .map_err(|e| BuildError::io(format!("setting permissions of {}", dest.display()), e))?;
        } else if file_type.is_symlink() {
            copy_symlink(item.path(), &dest)?;
        } else {
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)
                    .map_err(|e| BuildError::io(format!("replacing {}", dest.display()), e))?;
            }
            fs::copy(item.path(), &dest)
                .map_err(|e| BuildError::io(format!("copying {}", item.path().display()), e))?;
        }
        installed.push(tree_path(relative)?);
    }
    installed.sort();
    Ok(installed)
}

fn tree_path(relative: &Path) -> Result<String> {
    let segments = relative
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| BuildError::malformed(relative.display().to_string(), "path is not UTF-8"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(segments.join("/"))
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(source)
        .map_err(|e| BuildError::io(format!("reading link {}", source.display()), e))?;
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest).map_err(|e| BuildError::io(format!("replacing {}", dest.display()), e))?;
    }
    std::os::unix::fs::symlink(&target, dest)
        .map_err(|e| BuildError::io(format!("creating link {}", dest.display()), e))
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _dest: &Path) -> Result<()> {
    Err(BuildError::malformed(
        source.display().to_string(),
        "symbolic links are only supported on unix hosts",
    ))
}

#[derive(Debug, Default)]
struct PkgInfo {
    version: Option<String>,
    origin: Option<String>,
}

/// `pkgver` and `origin` from `.PKGINFO`, if present.
fn read_pkginfo(package: &Path) -> Result<PkgInfo> {
    let path = package.join(PKGINFO);
    if !path.exists() {
        return Ok(PkgInfo::default());
    }
    let text = fs::read_to_string(&path)
        .map_err(|e| BuildError::io(format!("reading {}", path.display()), e))?;
    let value = |wanted: &str| {
        text.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == wanted).then(|| value.trim().to_string())
        })
    };
    Ok(PkgInfo {
        version: value("pkgver"),
        origin: value("origin"),
    })
}

fn write_lines(root: &Path, path: &Path, lines: &[&str]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dirs(root, parent)?;
    }
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(path, text).map_err(|e| BuildError::io(format!("writing {}", path.display()), e))?;
    set_mode(path, FILE_MODE)
}
