use super::{is_collection, split, ChangeKind, DocChange, DocumentStore, OnChange, WatchHandle};
use crate::error::StoreError;
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// In-process [`DocumentStore`] with change feeds.
///
/// Clones share the same data, so two parties in one process can negotiate
/// through it. Callbacks run on the writer's task after the data lock is
/// released, serialized by a delivery lock so every watcher observes changes
/// in write order.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    delivery: Arc<Mutex<()>>,
}

struct Inner {
    available: bool,
    next_seq: u64,
    next_watch: u64,
    docs: HashMap<String, Stored>,
    watchers: HashMap<u64, Watcher>,
}

struct Stored {
    seq: u64,
    data: Value,
}

struct Watcher {
    path: String,
    on_change: OnChange,
}

type Delivery = Vec<(OnChange, DocChange)>;

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                next_seq: 0,
                next_watch: 0,
                docs: HashMap::new(),
                watchers: HashMap::new(),
            })),
            delivery: Arc::new(Mutex::new(())),
        }
    }

    /// Simulates an outage: while `false` every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Removes a document and notifies watchers with [`ChangeKind::Removed`].
    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        let _delivery = self.delivery.lock();
        let pending = {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            match inner.docs.remove(path) {
                Some(stored) => inner.collect(path, ChangeKind::Removed, stored.data),
                None => return Err(StoreError::NotFound(path.to_string())),
            }
        };
        deliver(pending);
        Ok(())
    }

    /// Delivers a raw change to the watchers of exactly `path`, as a
    /// misbehaving store would when re-sending an event.
    pub fn replay(&self, path: &str, change: DocChange) {
        let _delivery = self.delivery.lock();
        let pending: Delivery = {
            let inner = self.inner.lock();
            inner
                .watchers
                .values()
                .filter(|w| w.path == path)
                .map(|w| (w.on_change.clone(), change.clone()))
                .collect()
        };
        deliver(pending);
    }

    /// Number of live subscriptions.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    /// Items of a collection in insertion order, as `(id, data)`.
    pub fn list(&self, collection: &str) -> Vec<(String, Value)> {
        let inner = self.inner.lock();
        inner
            .children(collection)
            .into_iter()
            .map(|(id, stored)| (id.to_string(), stored.data.clone()))
            .collect()
    }

    fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let _delivery = self.delivery.lock();
        let pending = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.check_available()?;
            let kind = if let Some(stored) = inner.docs.get_mut(path) {
                stored.data = value.clone();
                ChangeKind::Modified
            } else {
                let seq = inner.bump();
                inner.docs.insert(
                    path.to_string(),
                    Stored {
                        seq,
                        data: value.clone(),
                    },
                );
                ChangeKind::Added
            };
            inner.collect(path, kind, value)
        };
        deliver(pending);
        Ok(())
    }
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn children(&self, collection: &str) -> Vec<(&str, &Stored)> {
        let mut items: Vec<_> = self
            .docs
            .iter()
            .filter_map(|(path, stored)| match split(path) {
                Some((parent, id)) if parent == collection => Some((id, stored)),
                _ => None,
            })
            .collect();
        items.sort_by_key(|(_, stored)| stored.seq);
        items
    }

    /// Watchers of the document itself and of its parent collection.
    fn collect(&self, path: &str, kind: ChangeKind, data: Value) -> Delivery {
        let Some((parent, id)) = split(path) else {
            return Vec::new();
        };
        let change = DocChange::new(kind, id, data);
        self.watchers
            .values()
            .filter(|w| w.path == path || w.path == parent)
            .map(|w| (w.on_change.clone(), change.clone()))
            .collect()
    }
}

fn deliver(pending: Delivery) {
    for (on_change, change) in pending {
        on_change(change);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.write(path, value)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.docs.get(path).map(|stored| stored.data.clone()))
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let _delivery = self.delivery.lock();
        let pending = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.check_available()?;
            let stored = inner
                .docs
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            match &mut stored.data {
                Value::Object(existing) => existing.extend(fields),
                other => *other = Value::Object(fields),
            }
            let data = stored.data.clone();
            inner.collect(path, ChangeKind::Modified, data)
        };
        deliver(pending);
        Ok(())
    }

    async fn append(&self, collection: &str, value: Value) -> Result<String, StoreError> {
        let id = random_id();
        let path = super::join(collection, &id);
        self.write(&path, value)?;
        debug!("appended {}", path);
        Ok(id)
    }

    fn watch(&self, path: &str, on_change: OnChange) -> Result<WatchHandle, StoreError> {
        let _delivery = self.delivery.lock();
        let (watch_id, initial) = {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            inner.next_watch += 1;
            let watch_id = inner.next_watch;

            let initial: Vec<DocChange> = if is_collection(path) {
                inner
                    .children(path)
                    .into_iter()
                    .map(|(id, stored)| DocChange::new(ChangeKind::Added, id, stored.data.clone()))
                    .collect()
            } else {
                match (inner.docs.get(path), split(path)) {
                    (Some(stored), Some((_, id))) => {
                        vec![DocChange::new(ChangeKind::Added, id, stored.data.clone())]
                    }
                    _ => Vec::new(),
                }
            };

            inner.watchers.insert(
                watch_id,
                Watcher {
                    path: path.to_string(),
                    on_change: on_change.clone(),
                },
            );
            (watch_id, initial)
        };

        for change in initial {
            on_change(change);
        }

        let inner = Arc::downgrade(&self.inner);
        Ok(WatchHandle::new(path, move || {
            if let Some(inner) = inner.upgrade() {
                inner.lock().watchers.remove(&watch_id);
            }
        }))
    }
}
