//! Shared fixtures for the controller integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use extmod_controller::docs::{DocsBuilder, DocsError};
use extmod_controller::downloader::{DownloadError, Downloader, DownloaderFactory};
use extmod_controller::fs::{ModuleTree, DEV_VERSION_DIR};
use extmod_controller::model::{
    Lease, ModuleDefinition, ModuleSource, PullOverride, Release, UpdatePolicy,
};
use extmod_controller::reconciler::ModuleSources;
use extmod_controller::restart::{restart_channel, RestartError, RestartHandle, RestartSignal};
use extmod_controller::validator::LayoutValidator;
use extmod_controller::{MemoryStore, ReconcilerConfig, ReleaseReconciler, Store, Stores};
use extmod_reconcile::gate::{APPROVAL_ANNOTATION, UPDATE_POLICY_LABEL};
use extmod_reconcile::{Phase, PolicyMode, Windows};
use semver::Version;
use tempfile::TempDir;

pub const SOURCE: &str = "main";
pub const CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Writes payloads straight into the module tree.
#[derive(Clone)]
pub struct FakeDownloads {
    tree: ModuleTree,
    missing: Arc<Mutex<HashSet<String>>>,
    dev_weights: Arc<Mutex<HashMap<String, u32>>>,
    pub fetched: Arc<Mutex<Vec<String>>>,
}

impl FakeDownloads {
    pub fn new(tree: ModuleTree) -> Self {
        Self {
            tree,
            missing: Arc::default(),
            dev_weights: Arc::default(),
            fetched: Arc::default(),
        }
    }

    /// Make `<module>@<version>` unavailable.
    pub fn make_missing(&self, module: &str, version: &str) {
        self.missing
            .lock()
            .unwrap()
            .insert(format!("{}@{}", module, version));
    }

    pub fn set_dev_weight(&self, module: &str, weight: u32) {
        self.dev_weights
            .lock()
            .unwrap()
            .insert(module.to_string(), weight);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downloader for FakeDownloads {
    async fn download_by_version(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<PathBuf, DownloadError> {
        let key = format!("{}@{}", module, version);
        if self.missing.lock().unwrap().contains(&key) {
            return Err(DownloadError::NotFound(key));
        }
        self.fetched.lock().unwrap().push(key);

        let path = self.tree.version_dir(module, &format!("v{}", version));
        fs::create_dir_all(path.join("openapi"))?;
        fs::write(path.join("openapi/config-values.yaml"), "type: object\n")?;
        Ok(path)
    }

    async fn download_dev_tag(
        &self,
        module: &str,
        tag: &str,
    ) -> Result<ModuleDefinition, DownloadError> {
        self.fetched
            .lock()
            .unwrap()
            .push(format!("{}:{}", module, tag));

        let path = self.tree.version_dir(module, DEV_VERSION_DIR);
        fs::create_dir_all(&path)?;
        let weight = self
            .dev_weights
            .lock()
            .unwrap()
            .get(module)
            .copied()
            .unwrap_or(900);
        Ok(ModuleDefinition {
            name: module.to_string(),
            weight,
            path,
        })
    }

    async fn documentation_archive(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<Bytes, DownloadError> {
        Ok(Bytes::from(format!("docs of {} {}", module, version)))
    }
}

impl DownloaderFactory for FakeDownloads {
    fn for_source(&self, _source: &ModuleSource) -> Result<Arc<dyn Downloader>, DownloadError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Records documentation pushes.
#[derive(Default)]
pub struct RecordingDocs {
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub builds: Mutex<Vec<String>>,
}

#[async_trait]
impl DocsBuilder for RecordingDocs {
    async fn send_documentation(
        &self,
        base: &str,
        module: &str,
        version: &Version,
        _archive: Bytes,
    ) -> Result<(), DocsError> {
        self.sent.lock().unwrap().push((
            base.to_string(),
            module.to_string(),
            version.to_string(),
        ));
        Ok(())
    }

    async fn build(&self, base: &str) -> Result<(), DocsError> {
        self.builds.lock().unwrap().push(base.to_string());
        Ok(())
    }
}

/// Records restart requests.
#[derive(Default)]
pub struct RecordingSignal {
    pub reasons: Mutex<Vec<String>>,
}

impl RestartSignal for RecordingSignal {
    fn signal(&self, reason: &str) -> Result<(), RestartError> {
        self.reasons.lock().unwrap().push(reason.to_string());
        Ok(())
    }
}

/// Stores, tree and fakes wired around a temporary module root.
pub struct Harness {
    pub dir: TempDir,
    pub tree: ModuleTree,
    pub releases: Arc<MemoryStore<Release>>,
    pub sources: Arc<MemoryStore<ModuleSource>>,
    pub policies: Arc<MemoryStore<UpdatePolicy>>,
    pub overrides: Arc<MemoryStore<PullOverride>>,
    pub leases: Arc<MemoryStore<Lease>>,
    pub downloads: FakeDownloads,
    pub docs: Arc<RecordingDocs>,
    pub signal: Arc<RecordingSignal>,
    pub module_sources: ModuleSources,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tree = ModuleTree::new(dir.path().join("external"));
        tree.ensure_dirs().unwrap();

        let harness = Self {
            downloads: FakeDownloads::new(tree.clone()),
            dir,
            tree,
            releases: Arc::new(MemoryStore::new()),
            sources: Arc::new(MemoryStore::new()),
            policies: Arc::new(MemoryStore::new()),
            overrides: Arc::new(MemoryStore::new()),
            leases: Arc::new(MemoryStore::new()),
            docs: Arc::new(RecordingDocs::default()),
            signal: Arc::new(RecordingSignal::default()),
            module_sources: ModuleSources::default(),
        };
        harness
            .sources
            .create(ModuleSource::new(SOURCE, "registry.example.com/modules"))
            .await
            .unwrap();
        harness
    }

    pub fn stores(&self) -> Stores {
        Stores {
            releases: self.releases.clone(),
            sources: self.sources.clone(),
            policies: self.policies.clone(),
            overrides: self.overrides.clone(),
            leases: self.leases.clone(),
        }
    }

    /// Start a restart coordinator with a short debounce window.
    pub fn restart_handle(&self) -> RestartHandle {
        let (handle, coordinator) =
            restart_channel(Duration::from_millis(20), self.signal.clone());
        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _tx = _tx;
            coordinator.run(rx).await
        });
        handle
    }

    pub fn reconciler(&self) -> ReleaseReconciler {
        ReleaseReconciler::new(
            self.stores(),
            self.tree.clone(),
            Arc::new(self.downloads.clone()),
            Arc::new(LayoutValidator),
            self.docs.clone(),
            self.restart_handle(),
            self.module_sources.clone(),
            ReconcilerConfig {
                check_interval: CHECK_INTERVAL,
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    pub async fn add_policy(&self, name: &str, mode: PolicyMode) {
        self.policies
            .create(UpdatePolicy::new(name, mode, Windows::default()))
            .await
            .unwrap();
    }

    /// Create a release in the given phase. `policy` sets the policy label.
    pub async fn add_release(
        &self,
        module: &str,
        version: &str,
        weight: u32,
        phase: Option<Phase>,
        policy: Option<&str>,
    ) -> Release {
        let mut release = Release::new(module, Version::parse(version).unwrap(), weight, SOURCE);
        if let Some(policy) = policy {
            release.metadata.set_label(UPDATE_POLICY_LABEL, policy);
        }
        let created = self.releases.create(release).await.unwrap();

        match phase {
            None => created,
            Some(phase) => {
                let mut with_status = created;
                with_status.status.phase = Some(phase);
                with_status.status.transition_time = Some(Utc::now());
                self.releases.update_status(&with_status).await.unwrap()
            }
        }
    }

    /// Create a deployed release with its payload and symlink on disk.
    pub async fn add_deployed(&self, module: &str, version: &str, weight: u32) -> Release {
        let release = self
            .add_release(module, version, weight, Some(Phase::Deployed), Some("auto"))
            .await;
        fs::create_dir_all(self.tree.version_dir(module, &release.version_dir())).unwrap();
        std::os::unix::fs::symlink(
            format!("../{}/{}", module, release.version_dir()),
            self.tree.symlink_path(&release.symlink_name()),
        )
        .unwrap();
        release
    }

    pub async fn approve(&self, name: &str, value: &str) {
        let mut release = self.releases.get(name).await.unwrap();
        release
            .metadata
            .annotations
            .insert(APPROVAL_ANNOTATION.to_string(), value.to_string());
        self.releases.update(&release).await.unwrap();
    }

    pub async fn release(&self, name: &str) -> Release {
        self.releases.get(name).await.unwrap()
    }

    pub async fn phase(&self, name: &str) -> Option<Phase> {
        self.release(name).await.phase()
    }

    pub async fn message(&self, name: &str) -> String {
        self.release(name).await.status.message
    }

    /// Target of an activation symlink, if it exists.
    pub fn link(&self, name: &str) -> Option<PathBuf> {
        fs::read_link(self.tree.symlink_path(name)).ok()
    }

    pub async fn deployed_count(&self, module: &str) -> usize {
        self.releases
            .list(&extmod_controller::store::LabelSelector::everything().with("module", module))
            .await
            .unwrap()
            .iter()
            .filter(|r| r.status.is(Phase::Deployed))
            .count()
    }

    /// Wait for the restart coordinator to act.
    pub async fn restarts(&self) -> Vec<String> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.signal.reasons.lock().unwrap().clone()
    }
}
