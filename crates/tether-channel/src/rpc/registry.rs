//! Export and singleton registries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;

use crate::object::RemoteHandle;

use super::interface::ServiceObject;

/// Objects this side has exported, by identity and by instance id.
///
/// Entries live as long as the channel; [`ExportRegistry::clear`] runs on
/// close.
pub struct ExportRegistry {
    by_identity: DashMap<usize, RemoteHandle>,
    by_id: DashMap<String, Arc<ServiceObject>>,
    nonce: [u8; 16],
    counter: AtomicU64,
}

impl Default for ExportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportRegistry {
    pub fn new() -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            by_identity: DashMap::new(),
            by_id: DashMap::new(),
            nonce,
            counter: AtomicU64::new(0),
        }
    }

    /// Register `object`, or return the handle it already has.
    pub fn export(&self, interfaces: Vec<String>, object: &Arc<ServiceObject>) -> RemoteHandle {
        match self.by_identity.entry(identity(object)) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(slot) => {
                let handle = RemoteHandle::new(self.next_instance_id(), interfaces);
                self.by_id.insert(handle.instance_id.clone(), object.clone());
                tracing::debug!(instance = %handle.instance_id, object = %object.label(), "exported");
                slot.insert(handle.clone());
                handle
            }
        }
    }

    pub fn lookup(&self, instance_id: &str) -> Option<Arc<ServiceObject>> {
        self.by_id.get(instance_id).map(|e| e.value().clone())
    }

    pub fn handle_of(&self, object: &Arc<ServiceObject>) -> Option<RemoteHandle> {
        self.by_identity
            .get(&identity(object))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&self) {
        self.by_identity.clear();
        self.by_id.clear();
    }

    /// Unique per registry and unguessable across processes.
    fn next_instance_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.nonce);
        hasher.update(&n.to_be_bytes());
        let digest = hasher.finalize();
        format!("{}-{n}", hex::encode(&digest.as_bytes()[..8]))
    }
}

fn identity(object: &Arc<ServiceObject>) -> usize {
    Arc::as_ptr(object) as usize
}

/// Named objects reachable by the peer as `@name` without an export.
/// Supplied by the embedder; clones share the same table.
#[derive(Clone, Default)]
pub struct Singletons {
    inner: Arc<DashMap<String, Arc<ServiceObject>>>,
}

impl Singletons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, object: Arc<ServiceObject>) {
        self.inner.insert(name.into(), object);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceObject>> {
        self.inner.get(name).map(|e| e.value().clone())
    }

    /// The name `object` is registered under, if any.
    pub fn name_of(&self, object: &Arc<ServiceObject>) -> Option<String> {
        self.inner
            .iter()
            .find(|e| Arc::ptr_eq(e.value(), object))
            .map(|e| e.key().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
