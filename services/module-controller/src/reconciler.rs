//! Release reconciliation.
//!
//! One pass per dequeued release name. Every pass re-reads the release and
//! its siblings from the store, so no per-module state survives between
//! passes apart from the module to source map kept for reporting.
//!
//! Outcomes map onto the queue as follows:
//! - converged, suspended or vanished: [`Action::Done`]
//! - blocked by policy or shadowed by a pull override: [`Action::RequeueAfter`]
//! - store, filesystem or documentation errors: `Err`, retried with backoff
//!
//! When a module has nothing newer to activate, its deployed release's symlink
//! is checked and recreated if it went missing.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use extmod_reconcile::{
    evaluate, predict, Action, GateDecision, Phase, PhaseError, PolicyRef, DEFAULT_CHECK_INTERVAL,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::docs::{self, DocsBuilder, DocsError};
use crate::downloader::{DownloadError, DownloaderFactory};
use crate::fs::{relative_target, ActivationError, ModuleTree};
use crate::model::{
    ModuleDefinition, ModuleSource, Release, FS_RELEASE_FINALIZER, MODULE_LABEL, SOURCE_RELEASE_FINALIZER,
    STATUS_LABEL,
};
use crate::preflight::RESTART_REASON_NOT_ENABLED;
use crate::restart::RestartHandle;
use crate::store::{self, LabelSelector, StoreError, Stores};
use crate::validator::{validate_module, ModuleValidator};

/// Restart reason after a new version was activated.
pub const RESTART_REASON_NEW_RELEASE: &str = "a new module release found";

/// Restart reason after a deployed module was removed from disk.
pub const RESTART_REASON_RELEASE_DELETED: &str = "a deployed module release was deleted";

/// Last known module to source mapping.
pub type ModuleSources = Arc<RwLock<HashMap<String, String>>>;

/// Errors that send a release back to the queue with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("filesystem: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Docs(#[from] DocsError),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Retry delay for policy-blocked releases and overridden modules.
    pub check_interval: Duration,

    /// Deadline for each store and documentation call.
    pub request_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconciles release records against the module tree.
pub struct ReleaseReconciler {
    stores: Stores,
    tree: ModuleTree,
    downloaders: Arc<dyn DownloaderFactory>,
    validator: Arc<dyn ModuleValidator>,
    docs: Arc<dyn DocsBuilder>,
    restart: RestartHandle,
    module_sources: ModuleSources,
    config: ReconcilerConfig,
}

impl ReleaseReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        tree: ModuleTree,
        downloaders: Arc<dyn DownloaderFactory>,
        validator: Arc<dyn ModuleValidator>,
        docs: Arc<dyn DocsBuilder>,
        restart: RestartHandle,
        module_sources: ModuleSources,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            stores,
            tree,
            downloaders,
            validator,
            docs,
            restart,
            module_sources,
            config,
        }
    }

    /// Bound a call by the request timeout.
    async fn bounded<T, E>(&self, call: impl Future<Output = Result<T, E>>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        store::bounded(self.config.request_timeout, call).await
    }

    /// Reconcile one release.
    #[instrument(skip(self), fields(release = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<Action, ReconcileError> {
        let release = match self.bounded(self.stores.releases.get(name)).await {
            Ok(release) => release,
            Err(e) if e.is_not_found() => {
                debug!("Release is gone");
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if release.metadata.is_deleting() {
            return self.delete_release(release).await;
        }

        match release.phase() {
            None => self.normalize(release).await,
            Some(Phase::Superseded | Phase::Suspended) => self.relabel(release).await,
            Some(Phase::Deployed) => self.deployed(release).await,
            Some(Phase::Pending) => self.pending(release).await,
        }
    }

    async fn normalize(&self, mut release: Release) -> Result<Action, ReconcileError> {
        if release.status.normalize(Utc::now()) {
            debug!(module = %release.module(), "Release marked pending");
            self.bounded(self.stores.releases.update_status(&release))
                .await?;
        }
        Ok(Action::Done)
    }

    async fn relabel(&self, mut release: Release) -> Result<Action, ReconcileError> {
        let Some(phase) = release.phase() else {
            return Ok(Action::Done);
        };
        if release.metadata.set_label(STATUS_LABEL, phase.label()) {
            self.bounded(self.stores.releases.update(&release)).await?;
        }
        Ok(Action::Done)
    }

    /// Assert labels and finalizers of a deployed release, then push its documentation.
    async fn deployed(&self, mut release: Release) -> Result<Action, ReconcileError> {
        self.module_sources
            .write()
            .await
            .insert(release.module().to_string(), release.source().to_string());

        let relabeled = release.metadata.set_label(STATUS_LABEL, Phase::Deployed.label());
        let finalized = release.metadata.add_finalizer(FS_RELEASE_FINALIZER);
        if relabeled || finalized {
            release = self.bounded(self.stores.releases.update(&release)).await?;
        }

        match self.bounded(self.stores.sources.get(release.source())).await {
            Ok(mut source) => {
                if source.metadata.add_finalizer(SOURCE_RELEASE_FINALIZER) {
                    self.bounded(self.stores.sources.update(&source)).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(source = %release.source(), "Source of deployed release not found");
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        }

        self.push_documentation(&release).await?;
        Ok(Action::Done)
    }

    async fn push_documentation(&self, release: &Release) -> Result<(), ReconcileError> {
        let addresses = self
            .bounded(docs::builder_addresses(self.stores.leases.as_ref()))
            .await?;
        if addresses.is_empty() {
            return Ok(());
        }

        let source = self
            .bounded(self.stores.sources.get(release.source()))
            .await?;
        let downloader = self.downloaders.for_source(&source)?;
        let archive = downloader
            .documentation_archive(release.module(), &release.spec.version)
            .await?;

        self.bounded(docs::publish(
            self.docs.as_ref(),
            &addresses,
            release.module(),
            &release.spec.version,
            archive,
        ))
        .await?;
        Ok(())
    }

    /// Drive a module forward from one of its pending releases.
    async fn pending(&self, release: Release) -> Result<Action, ReconcileError> {
        let module = release.module().to_string();

        match self.bounded(self.stores.overrides.get(&module)).await {
            Ok(_) => {
                debug!(module = %module, "Module is pinned by a pull override");
                return Ok(Action::RequeueAfter(self.config.check_interval));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let selector = LabelSelector::everything().with(MODULE_LABEL, module.as_str());
        let mut releases = self.bounded(self.stores.releases.list(&selector)).await?;
        releases.retain(|r| !r.metadata.is_deleting());
        releases.sort_by(|a, b| a.spec.version.cmp(&b.spec.version));

        let prediction = predict(&releases, |r| (&r.spec.version, r.phase()));
        if prediction.crosses_minor_lines {
            warn!(
                module = %module,
                "Pending releases span several minor lines, activating the newest only"
            );
        }

        let now = Utc::now();
        for index in prediction.stale.iter().chain(prediction.skipped.iter()) {
            let mut obsolete = releases[*index].clone();
            obsolete.status.transition(Phase::Superseded, "", now)?;
            self.bounded(self.stores.releases.update_status(&obsolete))
                .await?;
            info!(module = %module, version = %obsolete.spec.version, "Release superseded");
        }

        if let Some(current_index) = prediction.settled() {
            return self.restore_deployed(releases[current_index].clone()).await;
        }
        let Some(desired_index) = prediction.desired else {
            return Ok(Action::Done);
        };
        let mut desired = releases[desired_index].clone();

        let policy_name = desired.policy_name().map(str::to_string);
        let policy = match &policy_name {
            None => None,
            Some(name) => match self.bounded(self.stores.policies.get(name)).await {
                Ok(policy) => Some(policy),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            },
        };
        let policy_ref = match (&policy_name, &policy) {
            (None, _) => PolicyRef::Unset,
            (Some(name), None) => PolicyRef::Missing(name),
            (Some(_), Some(policy)) => PolicyRef::Found {
                mode: policy.spec.update.mode,
                windows: &policy.spec.update.windows,
            },
        };

        let decision = evaluate(policy_ref, desired.approval(), now);
        if let GateDecision::Blocked { message } = decision {
            debug!(module = %module, version = %desired.spec.version, reason = %message, "Release blocked");
            if desired.status.set_message(message) {
                self.bounded(self.stores.releases.update_status(&desired))
                    .await?;
            }
            return Ok(Action::RequeueAfter(self.config.check_interval));
        }

        let source = self
            .bounded(self.stores.sources.get(desired.source()))
            .await?;

        if let Err(message) = self.install(&desired, &source).await {
            warn!(module = %module, version = %desired.spec.version, reason = %message, "Release suspended");
            desired.status.transition(Phase::Suspended, message, now)?;
            self.bounded(self.stores.releases.update_status(&desired))
                .await?;
            return Ok(Action::Done);
        }

        if let Some(current_index) = prediction.current {
            let mut current = releases[current_index].clone();
            current.status.transition(Phase::Superseded, "", now)?;
            self.bounded(self.stores.releases.update_status(&current))
                .await?;
        }

        desired.status.transition(Phase::Deployed, "", now)?;
        self.bounded(self.stores.releases.update_status(&desired))
            .await?;

        self.module_sources
            .write()
            .await
            .insert(module.clone(), desired.source().to_string());
        self.restart.modules_changed(RESTART_REASON_NEW_RELEASE);

        info!(module = %module, version = %desired.spec.version, "Release deployed");
        Ok(Action::Done)
    }

    /// Make the deployed release's symlink exist and point at its version.
    /// A release whose payload cannot be linked is suspended.
    async fn restore_deployed(&self, mut release: Release) -> Result<Action, ReconcileError> {
        let module = release.module().to_string();
        let target = relative_target(&module, &release.version_dir());
        let expected = self.tree.symlink_path(&release.symlink_name());
        let existing = self.tree.find_symlink(&module)?;

        if existing.as_deref() == Some(expected.as_path())
            && self.tree.module_exists(&expected, &target)
        {
            return Ok(Action::Done);
        }

        if let Err(e) = self.tree.enable(existing.as_deref(), &expected, &target) {
            let message = problem(matches!(e, ActivationError::TargetMissing { .. }), &e);
            warn!(module = %module, version = %release.spec.version, reason = %message, "Deployed release suspended");
            release.status.transition(Phase::Suspended, message, Utc::now())?;
            self.bounded(self.stores.releases.update_status(&release))
                .await?;
            return Ok(Action::Done);
        }

        info!(module = %module, version = %release.spec.version, "Deployed module restored");
        self.restart.modules_changed(RESTART_REASON_NOT_ENABLED);
        Ok(Action::Done)
    }

    /// Download, validate and activate a release. Errors are status messages.
    async fn install(
        &self,
        release: &Release,
        source: &ModuleSource,
    ) -> Result<(), String> {
        let module = release.module();

        let path = async {
            let downloader = self.downloaders.for_source(source)?;
            downloader
                .download_by_version(module, &release.spec.version)
                .await
        }
        .await
        .map_err(|e| problem(e.is_not_found(), &e))?;

        let definition = ModuleDefinition {
            name: module.to_string(),
            weight: release.spec.weight,
            path,
        };
        validate_module(&definition, self.validator.as_ref())
            .map_err(|e| format!("validation failed: {}", e))?;

        let activate = || -> Result<(), ActivationError> {
            let current = self.tree.find_symlink(module)?;
            self.tree.enable(
                current.as_deref(),
                &self.tree.symlink_path(&release.symlink_name()),
                &relative_target(module, &release.version_dir()),
            )
        };
        activate().map_err(|e| problem(matches!(e, ActivationError::TargetMissing { .. }), &e))
    }

    /// Remove a release's files, then let the record go.
    async fn delete_release(&self, mut release: Release) -> Result<Action, ReconcileError> {
        let module = release.module().to_string();

        self.tree.remove_version(&module, &release.version_dir())?;

        if release.status.is(Phase::Deployed) {
            if let Some(link) = self.tree.find_symlink(&module)? {
                self.tree.remove_symlink(&link)?;
                self.restart.modules_changed(RESTART_REASON_RELEASE_DELETED);
            }
            self.module_sources.write().await.remove(&module);
        }

        if release.metadata.remove_finalizer(FS_RELEASE_FINALIZER) {
            self.bounded(self.stores.releases.update(&release)).await?;
        }

        info!(module = %module, version = %release.spec.version, "Release files removed");
        Ok(Action::Done)
    }
}

/// Status message for a failed download or activation.
fn problem(not_found: bool, err: &dyn std::fmt::Display) -> String {
    if not_found {
        "Desired version of the module met problems: not found".to_string()
    } else {
        format!("Desired version of the module met problems: {}", err)
    }
}
