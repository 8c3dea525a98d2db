//! Startup convergence between release records and the module tree.
//!
//! Runs once after the stores have synced and before any worker starts.
//! Whatever happened to the tree while the controller was down, after this
//! pass:
//! - every deployed release has its symlink, pointing at its own version
//! - every pull override has its development build linked
//! - no symlink remains for a module that has neither releases nor an override

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use extmod_reconcile::Phase;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::downloader::{DownloadError, DownloaderFactory};
use crate::fs::{relative_target, ActivationError, ModuleTree, DEV_VERSION_DIR};
use crate::model::{symlink_name, PullOverride, Release};
use crate::reconciler::ModuleSources;
use crate::restart::RestartHandle;
use crate::store::{self, LabelSelector, StoreError, Stores};

/// Restart reason after preflight touched the tree.
pub const RESTART_REASON_NOT_ENABLED: &str = "one of modules is not enabled";

/// Errors that abort the preflight pass.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("filesystem: {0}")]
    Io(#[from] io::Error),
}

/// Per-module failures. These are logged and left to the next start.
#[derive(Debug, Error)]
enum RepairError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error("filesystem: {0}")]
    Io(#[from] io::Error),
}

/// What a preflight pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// Modules whose deployed symlink was created or repaired.
    pub restored: Vec<String>,

    /// Modules whose pull override symlink was created.
    pub overridden: Vec<String>,

    /// Orphaned modules removed from disk.
    pub removed: Vec<String>,

    /// Modules that could not be repaired.
    pub failed: Vec<String>,
}

impl PreflightReport {
    pub fn changed_tree(&self) -> bool {
        !self.restored.is_empty() || !self.overridden.is_empty() || !self.removed.is_empty()
    }
}

/// The startup pass.
pub struct Preflight {
    stores: Stores,
    tree: ModuleTree,
    downloaders: Arc<dyn DownloaderFactory>,
    restart: RestartHandle,
    module_sources: ModuleSources,
    request_timeout: Duration,
}

impl Preflight {
    pub fn new(
        stores: Stores,
        tree: ModuleTree,
        downloaders: Arc<dyn DownloaderFactory>,
        restart: RestartHandle,
        module_sources: ModuleSources,
        request_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            tree,
            downloaders,
            restart,
            module_sources,
            request_timeout,
        }
    }

    #[instrument(skip(self), fields(root = %self.tree.root().display()))]
    pub async fn run(&self) -> Result<PreflightReport, PreflightError> {
        let everything = LabelSelector::everything();
        let releases = store::bounded(self.request_timeout, self.stores.releases.list(&everything))
            .await?;
        let overrides =
            store::bounded(self.request_timeout, self.stores.overrides.list(&everything)).await?;

        let mut report = PreflightReport::default();

        let mut deployed: BTreeMap<String, Release> = BTreeMap::new();
        for release in &releases {
            if !release.status.is(Phase::Deployed) || release.metadata.is_deleting() {
                continue;
            }
            let newer = deployed
                .get(release.module())
                .is_none_or(|seen| seen.spec.version < release.spec.version);
            if newer {
                deployed.insert(release.module().to_string(), release.clone());
            }
        }

        {
            let mut sources = self.module_sources.write().await;
            for release in deployed.values() {
                sources.insert(release.module().to_string(), release.source().to_string());
            }
        }

        let overridden: BTreeSet<&str> = overrides.iter().map(|o| o.metadata.name.as_str()).collect();

        for (module, release) in &deployed {
            if overridden.contains(module.as_str()) {
                continue;
            }
            match self.restore_release(release).await {
                Ok(true) => report.restored.push(module.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(module = %module, error = %e, "Failed to restore deployed module");
                    report.failed.push(module.clone());
                }
            }
        }

        for pull_override in &overrides {
            let module = pull_override.metadata.name.clone();
            match self.restore_override(pull_override).await {
                Ok(true) => report.overridden.push(module),
                Ok(false) => {}
                Err(e) => {
                    warn!(module = %module, error = %e, "Failed to restore pull override");
                    report.failed.push(module);
                }
            }
        }

        let known: BTreeSet<&str> = releases
            .iter()
            .map(Release::module)
            .chain(overridden.iter().copied())
            .collect();

        for (module, link) in self.tree.symlinked_modules()? {
            if known.contains(module.as_str()) {
                continue;
            }
            info!(module = %module, "Removing module without releases");
            self.tree.remove_symlink(&link)?;
            self.tree.remove_module(&module)?;
            report.removed.push(module);
        }

        if !report.restored.is_empty() || !report.overridden.is_empty() {
            self.restart.modules_changed(RESTART_REASON_NOT_ENABLED);
        }

        info!(
            restored = report.restored.len(),
            overridden = report.overridden.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Preflight complete"
        );
        Ok(report)
    }

    /// Make the deployed release's symlink exist and point at its version.
    /// Returns true if the tree changed.
    async fn restore_release(&self, release: &Release) -> Result<bool, RepairError> {
        let module = release.module();
        let target = relative_target(module, &release.version_dir());
        let expected = self.tree.symlink_path(&release.symlink_name());
        let existing = self.tree.find_symlink(module)?;

        if existing.as_deref() == Some(expected.as_path())
            && self.tree.module_exists(&expected, &target)
        {
            return Ok(false);
        }

        if !self.tree.version_dir(module, &release.version_dir()).is_dir() {
            let source =
                store::bounded(self.request_timeout, self.stores.sources.get(release.source()))
                    .await?;
            self.downloaders
                .for_source(&source)?
                .download_by_version(module, &release.spec.version)
                .await?;
        }

        self.tree.enable(existing.as_deref(), &expected, &target)?;
        info!(module = %module, version = %release.spec.version, "Deployed module restored");
        Ok(true)
    }

    /// Re-fetch a development build and make its symlink match its weight.
    /// Returns true if a symlink was created.
    async fn restore_override(&self, pull_override: &PullOverride) -> Result<bool, RepairError> {
        let module = pull_override.metadata.name.as_str();
        let source = store::bounded(
            self.request_timeout,
            self.stores.sources.get(&pull_override.spec.source),
        )
        .await?;

        let definition = self
            .downloaders
            .for_source(&source)?
            .download_dev_tag(module, &pull_override.spec.image_tag)
            .await?;

        let target = relative_target(module, DEV_VERSION_DIR);
        let expected = self.tree.symlink_path(&symlink_name(definition.weight, module));

        if let Some(existing) = self.tree.find_symlink(module)? {
            if existing != expected {
                warn!(module = %module, symlink = %existing.display(), "Removing stale override symlink");
                self.tree.remove_symlink(&existing)?;
            }
        }

        if self.tree.module_exists(&expected, &target) {
            return Ok(false);
        }

        self.tree.enable(None, &expected, &target)?;
        self.module_sources
            .write()
            .await
            .insert(module.to_string(), pull_override.spec.source.clone());
        info!(module = %module, tag = %pull_override.spec.image_tag, "Pull override restored");
        Ok(true)
    }
}
