//! Controller wiring.
//!
//! ```text
//! release watch ──► release queue ──► N × ReleaseReconciler
//! lease watch   ──► lease queue   ──► N × re-enqueue deployed releases
//!                                         │
//!                       RestartCoordinator ◄┘ (module tree changed)
//! ```
//!
//! [`Controller::run`] syncs the stores, runs the preflight pass, then
//! processes events until shutdown, draining in-flight work before it
//! returns.

use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::sync::Arc;

use extmod_reconcile::{Action, BackoffPolicy, Phase};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::docs::{DocsBuilder, DocsBuilderClient, DocsError};
use crate::downloader::{DownloaderFactory, MirrorDownloaderFactory};
use crate::fs::ModuleTree;
use crate::model::{Lease, Release, Resource, DOCS_LEASE_LABEL};
use crate::preflight::{Preflight, PreflightError};
use crate::queue::WorkQueue;
use crate::reconciler::{ModuleSources, ReconcilerConfig, ReleaseReconciler};
use crate::restart::{restart_channel, ProcessSignal, RestartError, RestartSignal};
use crate::store::{self, LabelSelector, StoreError, Stores, WatchEvent};
use crate::validator::{LayoutValidator, ModuleValidator};

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("prepare module tree: {0}")]
    Io(#[from] io::Error),

    #[error("object store cache did not sync")]
    CacheSync,

    #[error("initial listing: {0}")]
    Store(#[from] StoreError),

    #[error("preflight: {0}")]
    Preflight(#[from] PreflightError),

    #[error("restart coordinator: {0}")]
    Restart(#[from] RestartError),

    #[error("documentation client: {0}")]
    Docs(#[from] DocsError),

    #[error("restart coordinator task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The external module release controller.
pub struct Controller {
    config: Config,
    stores: Stores,
    downloaders: Option<Arc<dyn DownloaderFactory>>,
    validator: Arc<dyn ModuleValidator>,
    docs: Option<Arc<dyn DocsBuilder>>,
    restart_signal: Arc<dyn RestartSignal>,
    module_sources: ModuleSources,
}

impl Controller {
    pub fn new(config: Config, stores: Stores) -> Self {
        let restart_signal = Arc::new(ProcessSignal::new(config.restart_pid));
        Self {
            config,
            stores,
            downloaders: None,
            validator: Arc::new(LayoutValidator),
            docs: None,
            restart_signal,
            module_sources: ModuleSources::default(),
        }
    }

    pub fn with_downloaders(mut self, downloaders: Arc<dyn DownloaderFactory>) -> Self {
        self.downloaders = Some(downloaders);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ModuleValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_docs_builder(mut self, docs: Arc<dyn DocsBuilder>) -> Self {
        self.docs = Some(docs);
        self
    }

    pub fn with_restart_signal(mut self, signal: Arc<dyn RestartSignal>) -> Self {
        self.restart_signal = signal;
        self
    }

    /// Last known source of every module.
    pub async fn module_sources(&self) -> HashMap<String, String> {
        self.module_sources.read().await.clone()
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Returns immediately when no module directory is configured.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let Some(root) = self.config.modules_dir.clone() else {
            info!("External modules directory not set, module controller disabled");
            return Ok(());
        };

        let tree = ModuleTree::new(root);
        tree.ensure_dirs()?;

        if !self.stores.wait_synced().await {
            return Err(ControllerError::CacheSync);
        }

        let downloaders: Arc<dyn DownloaderFactory> = match &self.downloaders {
            Some(downloaders) => Arc::clone(downloaders),
            None => Arc::new(MirrorDownloaderFactory::new(
                tree.clone(),
                self.config.request_timeout,
            )),
        };
        let docs: Arc<dyn DocsBuilder> = match &self.docs {
            Some(docs) => Arc::clone(docs),
            None => Arc::new(DocsBuilderClient::new(self.config.request_timeout)?),
        };

        let (restart, coordinator) =
            restart_channel(self.config.restart_delay, Arc::clone(&self.restart_signal));
        let mut coordinator = tokio::spawn(coordinator.run(shutdown.clone()));

        let preflight = Preflight::new(
            self.stores.clone(),
            tree.clone(),
            Arc::clone(&downloaders),
            restart.clone(),
            Arc::clone(&self.module_sources),
            self.config.request_timeout,
        )
        .run()
        .await;
        if let Err(e) = preflight {
            coordinator.abort();
            return Err(e.into());
        }

        let reconciler = Arc::new(ReleaseReconciler::new(
            self.stores.clone(),
            tree,
            downloaders,
            Arc::clone(&self.validator),
            docs,
            restart,
            Arc::clone(&self.module_sources),
            ReconcilerConfig {
                check_interval: self.config.check_interval,
                request_timeout: self.config.request_timeout,
            },
        ));

        let releases: WorkQueue<String> = WorkQueue::new(BackoffPolicy::default());
        let leases: WorkQueue<String> = WorkQueue::new(BackoffPolicy::default());

        // Subscribe before listing so nothing falls between the two
        let release_events = self.stores.releases.watch();
        let lease_events = self.stores.leases.watch();
        self.enqueue_all(&releases).await?;

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(pump_releases(
                release_events,
                self.stores.clone(),
                releases.clone(),
                self.config.request_timeout,
            )),
            tokio::spawn(pump_leases(lease_events, leases.clone())),
        ];
        let pumps = tasks.len();

        for worker in 0..self.config.workers {
            let queue = releases.clone();
            let reconciler = Arc::clone(&reconciler);
            tasks.push(tokio::spawn(run_worker(worker, queue, move |key| {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.reconcile(&key).await }
            })));

            let queue = leases.clone();
            let stores = self.stores.clone();
            let target = releases.clone();
            let timeout = self.config.request_timeout;
            tasks.push(tokio::spawn(run_worker(worker, queue, move |key| {
                let stores = stores.clone();
                let target = target.clone();
                async move { requeue_deployed(&key, &stores, &target, timeout).await }
            })));
        }

        info!(workers = self.config.workers, "Module controller started");

        let outcome = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Module controller shutting down");
                        break Ok(());
                    }
                }
                result = &mut coordinator => {
                    break match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            error!(error = %e, "Restart coordinator failed");
                            Err(ControllerError::Restart(e))
                        }
                        Err(e) => {
                            error!(error = %e, "Restart coordinator panicked");
                            Err(ControllerError::Task(e))
                        }
                    };
                }
            }
        };

        releases.shut_down();
        leases.shut_down();

        let workers = tasks.split_off(pumps);
        for pump in tasks {
            pump.abort();
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker panicked");
            }
        }
        if !coordinator.is_finished() {
            coordinator.abort();
        }

        info!("Module controller stopped");
        outcome
    }

    async fn enqueue_all(&self, queue: &WorkQueue<String>) -> Result<(), StoreError> {
        let releases = store::bounded(
            self.config.request_timeout,
            self.stores.releases.list(&LabelSelector::everything()),
        )
        .await?;
        for release in releases {
            queue.add(release.metadata.name);
        }
        Ok(())
    }
}

/// Pull keys from `queue` and feed them to `process` until the queue drains.
async fn run_worker<F, Fut, E>(worker: usize, queue: WorkQueue<String>, process: F)
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<Action, E>>,
    E: Display,
{
    while let Some(key) = queue.get().await {
        match process(key.clone()).await {
            Ok(Action::Done) => queue.forget(&key),
            Ok(Action::Requeue) => queue.add_rate_limited(key.clone()),
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                warn!(
                    worker,
                    key = %key,
                    retries = queue.num_requeues(&key),
                    error = %e,
                    "Reconciliation failed, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(worker, "Worker stopped");
}

/// Enqueue release changes. Modifications that did not move the resource
/// version are dropped.
async fn pump_releases(
    mut events: broadcast::Receiver<WatchEvent<Release>>,
    stores: Stores,
    queue: WorkQueue<String>,
    timeout: std::time::Duration,
) {
    loop {
        match events.recv().await {
            Ok(WatchEvent::Modified { old, new })
                if old.meta().resource_version == new.meta().resource_version => {}
            Ok(event) => queue.add(event.object().name().to_string()),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Release watch lagged, relisting");
                match store::bounded(timeout, stores.releases.list(&LabelSelector::everything()))
                    .await
                {
                    Ok(releases) => releases
                        .into_iter()
                        .for_each(|r| queue.add(r.metadata.name)),
                    Err(e) => error!(error = %e, "Relist after lag failed"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Enqueue new documentation builders.
async fn pump_leases(mut events: broadcast::Receiver<WatchEvent<Lease>>, queue: WorkQueue<String>) {
    loop {
        match events.recv().await {
            Ok(WatchEvent::Added(lease)) if lease.metadata.labels.contains_key(DOCS_LEASE_LABEL) => {
                queue.add(lease.metadata.name)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Lease watch lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// A new builder appeared: send every deployed release through the reconciler
/// so its documentation reaches the builder.
async fn requeue_deployed(
    lease: &str,
    stores: &Stores,
    releases: &WorkQueue<String>,
    timeout: std::time::Duration,
) -> Result<Action, StoreError> {
    let deployed: Vec<Release> = store::bounded(
        timeout,
        stores.releases.list(&LabelSelector::everything()),
    )
    .await?
    .into_iter()
    .filter(|r| r.status.is(Phase::Deployed))
    .collect();

    debug!(lease = %lease, releases = deployed.len(), "Documentation builder appeared");
    for release in deployed {
        releases.add(release.metadata.name);
    }
    Ok(Action::Done)
}
