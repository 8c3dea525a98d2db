//! Object store abstraction.
//!
//! The controller reads and writes records through [`Store`]. Updates are
//! optimistic: every write carries the resource version it was based on and
//! fails with [`StoreError::Conflict`] if the record moved in the meantime.
//! Status and spec are written separately.
//!
//! Deletion honours finalizers. Deleting a record that still carries
//! finalizers only stamps its deletion timestamp; the record disappears once
//! the last finalizer is removed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Lease, ModuleSource, PullOverride, Release, Resource, UpdatePolicy};

mod memory;

pub use memory::MemoryStore;

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("store request timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A change observed on a store.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Modified { old: T, new: T },
    Deleted(T),
}

impl<T: Resource> WatchEvent<T> {
    /// The record as it is after the event.
    pub fn object(&self) -> &T {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Modified { new, .. } => new,
        }
    }
}

/// Equality-based label selector.
///
/// A `None` value matches any record carrying the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, Option<String>>,
}

impl LabelSelector {
    /// Selector matching every record.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), Some(value.into()));
        self
    }

    /// Require `key` to be present.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), None);
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(key, want)| match (labels.get(key), want) {
                (Some(_), None) => true,
                (Some(have), Some(want)) => have == want,
                (None, _) => false,
            })
    }
}

/// Typed access to one kind of record.
#[async_trait]
pub trait Store<T: Resource>: Send + Sync {
    async fn get(&self, name: &str) -> Result<T, StoreError>;

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<T>, StoreError>;

    async fn create(&self, object: T) -> Result<T, StoreError>;

    /// Write metadata and spec. The status carried by `object` is ignored.
    async fn update(&self, object: &T) -> Result<T, StoreError>;

    /// Write the status subresource only.
    async fn update_status(&self, object: &T) -> Result<T, StoreError>;

    /// Request deletion.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Subscribe to changes made after this call.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;

    /// Wait until the local view is complete. Returns false if it never will be.
    async fn wait_synced(&self) -> bool;
}

/// Run a store-backed call under a deadline.
pub async fn bounded<T, E>(timeout: Duration, call: impl Future<Output = Result<T, E>>) -> Result<T, E>
where
    E: From<StoreError>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout.into()),
    }
}

/// Every store the controller reads or writes.
#[derive(Clone)]
pub struct Stores {
    pub releases: Arc<dyn Store<Release>>,
    pub sources: Arc<dyn Store<ModuleSource>>,
    pub policies: Arc<dyn Store<UpdatePolicy>>,
    pub overrides: Arc<dyn Store<PullOverride>>,
    pub leases: Arc<dyn Store<Lease>>,
}

impl Stores {
    /// Empty in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            releases: Arc::new(MemoryStore::new()),
            sources: Arc::new(MemoryStore::new()),
            policies: Arc::new(MemoryStore::new()),
            overrides: Arc::new(MemoryStore::new()),
            leases: Arc::new(MemoryStore::new()),
        }
    }

    /// Wait for every store to sync.
    pub async fn wait_synced(&self) -> bool {
        self.releases.wait_synced().await
            && self.sources.wait_synced().await
            && self.policies.wait_synced().await
            && self.overrides.wait_synced().await
            && self.leases.wait_synced().await
    }
}
