//! Shared document store contract.
//!
//! Calls are negotiated entirely through a document store with
//! change-notification subscriptions. This module defines the operations the
//! negotiation layer relies on ([`DocumentStore`]), the change events it
//! consumes ([`DocChange`]), cancellable subscriptions ([`WatchHandle`]) and
//! the path scheme of a call ([`StoreLayout`]).
//!
//! Paths are `/`-separated. A path with an odd number of segments names a
//! collection (`calls`, `calls/abc/offerCandidates`), an even number names a
//! document (`calls/abc`).

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::peer::state::Role;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Classification of a single change delivered by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub kind: ChangeKind,
    /// Last path segment of the changed document
    pub id: String,
    pub data: Value,
}

impl DocChange {
    pub fn new(kind: ChangeKind, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
        }
    }
}

/// Change callback. Must not block and must not call back into the store.
pub type OnChange = Arc<dyn Fn(DocChange) + Send + Sync>;

/// Operations over the shared store.
///
/// `watch` on a document delivers the current document as [`ChangeKind::Added`]
/// and every later change to it. `watch` on a collection delivers every
/// existing item as `Added` in insertion order, then one event per change. A
/// correct store never delivers `Added` twice for the same item.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Writes a whole document, replacing any previous content.
    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Reads a document once.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Merges top-level fields into an existing document.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Adds a document with a store-generated id to a collection.
    async fn append(&self, collection: &str, value: Value) -> Result<String, StoreError>;

    /// Subscribes to changes under `path` until the handle is cancelled.
    fn watch(&self, path: &str, on_change: OnChange) -> Result<WatchHandle, StoreError>;
}

/// A live subscription returned by [`DocumentStore::watch`].
///
/// Dropping the handle does not cancel it; the owner cancels explicitly.
pub struct WatchHandle {
    path: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(path: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path: path.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Stops delivery. Calling it again does nothing.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Collection names used for one call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreLayout {
    pub sessions: String,
    pub offer_candidates: String,
    pub answer_candidates: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            sessions: "calls".into(),
            offer_candidates: "offerCandidates".into(),
            answer_candidates: "answerCandidates".into(),
        }
    }
}

impl StoreLayout {
    pub fn session_path(&self, session_id: &str) -> String {
        join(&self.sessions, session_id)
    }

    /// Collection the given role writes its own candidates to.
    pub fn candidates_path(&self, session_id: &str, writer: Role) -> String {
        let collection = match writer {
            Role::Caller => &self.offer_candidates,
            Role::Callee => &self.answer_candidates,
        };
        join(&self.session_path(session_id), collection)
    }
}

pub fn join(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child.trim_start_matches('/'))
}

pub fn is_collection(path: &str) -> bool {
    segments(path).count() % 2 == 1
}

/// Splits a document path into its collection and id.
pub fn split(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_matches('/');
    path.rsplit_once('/')
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
