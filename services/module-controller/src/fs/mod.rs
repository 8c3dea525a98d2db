//! On-disk module tree.
//!
//! ```text
//! <root>/
//! ├── <module>/
//! │   ├── v1.2.3/        versioned payload written by the downloader
//! │   └── dev/           payload of a pull override
//! └── modules/
//!     └── 910-<module> -> ../<module>/v1.2.3
//! ```
//!
//! The symlink under `modules/` is the only activation point. Exactly one
//! may exist per module name; its weight prefix may change between versions.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

mod activator;

pub use activator::ActivationError;

/// Directory holding the activation symlinks.
pub const SYMLINKS_DIR: &str = "modules";

/// Version directory used by pull overrides.
pub const DEV_VERSION_DIR: &str = "dev";

/// Paths and operations on the module tree.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    root: PathBuf,
    symlinks_dir: PathBuf,
}

impl ModuleTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let symlinks_dir = root.join(SYMLINKS_DIR);
        Self { root, symlinks_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn symlinks_dir(&self) -> &Path {
        &self.symlinks_dir
    }

    /// Create the root and the symlink directory.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.symlinks_dir)
    }

    /// `<root>/<module>`.
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(module)
    }

    /// `<root>/<module>/<version_dir>`.
    pub fn version_dir(&self, module: &str, version_dir: &str) -> PathBuf {
        self.module_dir(module).join(version_dir)
    }

    /// `<root>/modules/<name>`.
    pub fn symlink_path(&self, name: &str) -> PathBuf {
        self.symlinks_dir.join(name)
    }

    /// Remove a version's payload. Missing directories are fine.
    pub fn remove_version(&self, module: &str, version_dir: &str) -> io::Result<()> {
        let path = self.version_dir(module, version_dir);
        debug!(path = %path.display(), "Removing module version");
        ignore_not_found(fs::remove_dir_all(path))
    }

    /// Remove every version of a module. Missing directories are fine.
    ///
    /// Names that do not denote a module directory are rejected.
    pub fn remove_module(&self, module: &str) -> io::Result<()> {
        if !is_module_name(module) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to remove {:?}: not a module name", module),
            ));
        }
        let path = self.module_dir(module);
        debug!(path = %path.display(), "Removing module tree");
        ignore_not_found(fs::remove_dir_all(path))
    }

    /// Remove a symlink. A missing link is fine.
    pub fn remove_symlink(&self, path: &Path) -> io::Result<()> {
        debug!(path = %path.display(), "Removing module symlink");
        ignore_not_found(fs::remove_file(path))
    }

    /// Module names of every activation symlink, paired with the link path.
    ///
    /// Only `<weight>-<module>` entries with a numeric weight are reported.
    /// A missing symlink directory yields an empty list.
    pub fn symlinked_modules(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let entries = match fs::read_dir(&self.symlinks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut modules = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((weight, module)) = name.split_once('-') else {
                continue;
            };
            if weight.is_empty()
                || !weight.bytes().all(|b| b.is_ascii_digit())
                || !is_module_name(module)
            {
                debug!(entry = %name, "Skipping unrecognised entry in symlink directory");
                continue;
            }
            modules.push((module.to_string(), entry.path()));
        }
        modules.sort();
        Ok(modules)
    }
}

/// Relative link target for a version directory: `../<module>/<version_dir>`.
pub fn relative_target(module: &str, version_dir: &str) -> PathBuf {
    Path::new("..").join(module).join(version_dir)
}

fn is_module_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && name != SYMLINKS_DIR && !name.contains('/')
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
