//! Activation symlink management.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use super::ModuleTree;

/// Errors from activating a module version.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("remove symlink {path}: {source}")]
    RemoveSymlink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("module payload {path} not found")]
    TargetMissing { path: PathBuf },

    #[error("stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("create symlink {path}: {source}")]
    CreateSymlink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid module name {0:?}")]
    InvalidName(String),
}

impl ModuleTree {
    /// Point `new_symlink` at `relative`, replacing `old_symlink` if given.
    ///
    /// `relative` is the link target as seen from the symlink directory
    /// (`../<module>/v<version>`). The payload must already exist; the new
    /// link is only created once every prior step succeeded.
    pub fn enable(
        &self,
        old_symlink: Option<&Path>,
        new_symlink: &Path,
        relative: &Path,
    ) -> Result<(), ActivationError> {
        if let Some(old) = old_symlink {
            remove_link(old)?;
        }
        remove_link(new_symlink)?;

        let target = self.resolve_relative(relative);
        match fs::metadata(&target) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ActivationError::TargetMissing { path: target });
            }
            Err(source) => return Err(ActivationError::Stat { path: target, source }),
        }

        symlink(relative, new_symlink).map_err(|source| ActivationError::CreateSymlink {
            path: new_symlink.to_path_buf(),
            source,
        })?;

        info!(
            symlink = %new_symlink.display(),
            target = %relative.display(),
            "Module symlink created"
        );
        Ok(())
    }

    /// Find the activation symlink of `module`, whatever its weight prefix.
    pub fn find_symlink(&self, module: &str) -> Result<Option<PathBuf>, ActivationError> {
        let pattern = Regex::new(&format!(r"^(([0-9]+)-)?({})$", regex::escape(module)))
            .map_err(|_| ActivationError::InvalidName(module.to_string()))?;

        let entries = match fs::read_dir(&self.symlinks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ActivationError::Scan {
                    path: self.symlinks_dir.clone(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| ActivationError::Scan {
                path: self.symlinks_dir.clone(),
                source,
            })?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| pattern.is_match(name))
            {
                return Ok(Some(entry.path()));
            }
        }

        Ok(None)
    }

    /// Returns true if `symlink` resolves to the payload at `relative`.
    pub fn module_exists(&self, symlink: &Path, relative: &Path) -> bool {
        let Ok(actual) = fs::canonicalize(symlink) else {
            return false;
        };
        let Ok(expected) = fs::canonicalize(self.resolve_relative(relative)) else {
            return false;
        };
        actual == expected
    }

    /// Absolute payload path for a link target relative to the symlink directory.
    fn resolve_relative(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            return relative.to_path_buf();
        }
        let stripped: PathBuf = relative
            .components()
            .skip_while(|c| *c == Component::ParentDir)
            .collect();
        self.root.join(stripped)
    }
}

fn remove_link(path: &Path) -> Result<(), ActivationError> {
    match fs::symlink_metadata(path) {
        Ok(_) => {
            debug!(path = %path.display(), "Removing existing symlink");
            fs::remove_file(path).map_err(|source| ActivationError::RemoveSymlink {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ActivationError::RemoveSymlink {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::relative_target;
    use tempfile::TempDir;

    fn tree_with(versions: &[(&str, &str)]) -> (TempDir, ModuleTree) {
        let dir = TempDir::new().unwrap();
        let tree = ModuleTree::new(dir.path());
        tree.ensure_dirs().unwrap();
        for (module, version) in versions {
            fs::create_dir_all(tree.version_dir(module, version)).unwrap();
        }
        (dir, tree)
    }

    #[test]
    fn test_enable_creates_relative_link() {
        let (_dir, tree) = tree_with(&[("foo", "v1.0.0")]);
        let link = tree.symlink_path("910-foo");
        let target = relative_target("foo", "v1.0.0");

        tree.enable(None, &link, &target).unwrap();

        assert_eq!(fs::read_link(&link).unwrap(), target);
        assert!(tree.module_exists(&link, &target));
    }

    #[test]
    fn test_enable_is_idempotent() {
        let (_dir, tree) = tree_with(&[("foo", "v1.0.0")]);
        let link = tree.symlink_path("910-foo");
        let target = relative_target("foo", "v1.0.0");

        tree.enable(None, &link, &target).unwrap();
        tree.enable(Some(&link), &link, &target).unwrap();

        assert_eq!(fs::read_link(&link).unwrap(), target);
    }

    #[test]
    fn test_weight_migration_replaces_old_link() {
        let (_dir, tree) = tree_with(&[("foo", "v1.0.0"), ("foo", "v1.1.0")]);
        let old = tree.symlink_path("900-foo");
        tree.enable(None, &old, &relative_target("foo", "v1.0.0"))
            .unwrap();

        let existing = tree.find_symlink("foo").unwrap();
        assert_eq!(existing.as_deref(), Some(old.as_path()));

        let new = tree.symlink_path("950-foo");
        let target = relative_target("foo", "v1.1.0");
        tree.enable(existing.as_deref(), &new, &target).unwrap();

        assert!(fs::symlink_metadata(&old).is_err());
        assert_eq!(fs::read_link(&new).unwrap(), target);
        assert_eq!(tree.find_symlink("foo").unwrap(), Some(new));
    }

    #[test]
    fn test_missing_payload_fails_without_linking() {
        let (_dir, tree) = tree_with(&[]);
        let link = tree.symlink_path("910-foo");

        let err = tree
            .enable(None, &link, &relative_target("foo", "v9.9.9"))
            .unwrap_err();

        assert!(matches!(err, ActivationError::TargetMissing { .. }));
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn test_find_symlink_matches_whole_name() {
        let (_dir, tree) = tree_with(&[("foo", "v1.0.0"), ("foo-bar", "v1.0.0")]);
        tree.enable(
            None,
            &tree.symlink_path("920-foo-bar"),
            &relative_target("foo-bar", "v1.0.0"),
        )
        .unwrap();

        assert_eq!(tree.find_symlink("foo").unwrap(), None);
        assert_eq!(tree.find_symlink("bar").unwrap(), None);
        assert!(tree.find_symlink("foo-bar").unwrap().is_some());
    }

    #[test]
    fn test_module_exists_detects_wrong_version() {
        let (_dir, tree) = tree_with(&[("foo", "v1.0.0"), ("foo", "v1.1.0")]);
        let link = tree.symlink_path("910-foo");
        tree.enable(None, &link, &relative_target("foo", "v1.0.0"))
            .unwrap();

        assert!(tree.module_exists(&link, &relative_target("foo", "v1.0.0")));
        assert!(!tree.module_exists(&link, &relative_target("foo", "v1.1.0")));
        assert!(!tree.module_exists(
            &tree.symlink_path("910-absent"),
            &relative_target("foo", "v1.0.0")
        ));
    }
}
