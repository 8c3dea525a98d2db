//! In-process store.
//!
//! Backs the binary when no external API is wired in and backs the tests.
//! Writes that would not change a record are accepted without bumping its
//! resource version or emitting an event.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::{LabelSelector, Store, StoreError, WatchEvent};
use crate::model::Resource;

const WATCH_CAPACITY: usize = 1024;

struct Inner<T> {
    objects: BTreeMap<String, T>,
    last_version: u64,
}

impl<T: Resource> Inner<T> {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn existing(&self, name: &str) -> Result<&T, StoreError> {
        self.objects.get(name).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            name: name.to_string(),
        })
    }
}

/// A [`Store`] held in memory.
pub struct MemoryStore<T> {
    inner: Mutex<Inner<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
    unavailable: AtomicBool,
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                last_version: 0,
            }),
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{} store is offline",
                T::KIND
            )));
        }
        Ok(())
    }

    fn check_version(existing: &T, object: &T) -> Result<(), StoreError> {
        if existing.meta().resource_version != object.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                name: object.name().to_string(),
            });
        }
        Ok(())
    }

    /// Store `new` in place of `old`, or drop it if deletion has completed.
    fn commit(&self, inner: &mut Inner<T>, old: T, mut new: T) -> T {
        new.meta_mut().resource_version = inner.next_version();
        let name = new.name().to_string();

        if new.meta().is_deleting() && new.meta().finalizers.is_empty() {
            debug!(kind = T::KIND, name = %name, "Last finalizer removed, deleting");
            inner.objects.remove(&name);
            let _ = self.events.send(WatchEvent::Deleted(new.clone()));
        } else {
            inner.objects.insert(name, new.clone());
            let _ = self.events.send(WatchEvent::Modified {
                old,
                new: new.clone(),
            });
        }
        new
    }
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> Store<T> for MemoryStore<T> {
    async fn get(&self, name: &str) -> Result<T, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        inner.existing(name).cloned()
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<T>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .values()
            .filter(|obj| selector.matches(&obj.meta().labels))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: T) -> Result<T, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        if inner.objects.contains_key(object.name()) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                name: object.name().to_string(),
            });
        }

        object.meta_mut().resource_version = inner.next_version();
        object.meta_mut().deletion_timestamp = None;
        inner
            .objects
            .insert(object.name().to_string(), object.clone());
        let _ = self.events.send(WatchEvent::Added(object.clone()));
        Ok(object)
    }

    async fn update(&self, object: &T) -> Result<T, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let existing = inner.existing(object.name())?.clone();
        Self::check_version(&existing, object)?;

        let mut new = object.clone();
        new.copy_status_from(&existing);
        new.meta_mut().deletion_timestamp = existing.meta().deletion_timestamp;

        if new == existing {
            return Ok(existing);
        }
        Ok(self.commit(&mut inner, existing, new))
    }

    async fn update_status(&self, object: &T) -> Result<T, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let existing = inner.existing(object.name())?.clone();
        Self::check_version(&existing, object)?;

        let mut new = existing.clone();
        new.copy_status_from(object);

        if new == existing {
            return Ok(existing);
        }
        Ok(self.commit(&mut inner, existing, new))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let existing = inner.existing(name)?.clone();
        if existing.meta().is_deleting() {
            return Ok(());
        }

        let mut new = existing.clone();
        new.meta_mut().deletion_timestamp = Some(Utc::now());
        self.commit(&mut inner, existing, new);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }

    async fn wait_synced(&self) -> bool {
        true
    }
}
