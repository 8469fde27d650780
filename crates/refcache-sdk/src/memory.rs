//! In-memory service registry
//!
//! `MemoryRegistry` is a complete, thread-safe [`ServiceRegistry`]
//! implementation backed by an ordered map. It exists for embedding the
//! subsystem without a real component registry and for integration tests:
//! every acquire and release is counted, so tests can assert that reference
//! acquisition stays balanced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{NameError, RegistryError};
use crate::name::ImplName;
use crate::registry::{
    ImplHandle, NotificationHandler, RegisteredHandler, RegistryIter, ServiceRegistry,
};

struct ImplRecord {
    handle: u64,
    refs: u64,
}

/// Thread-safe in-process service registry.
///
/// Implementations are stored in a `BTreeMap` keyed by fully-qualified name,
/// so iteration is lexicographic: all implementations of a service appear
/// consecutively, and an iterator opened for one service runs into the next
/// service's group after the last entry — exactly the enumeration contract
/// consumers of [`RegistryIter`] are written against.
pub struct MemoryRegistry {
    impls: RwLock<BTreeMap<String, ImplRecord>>,
    /// Reverse index handle -> name, used by `release`
    by_handle: DashMap<u64, String>,
    handlers: RwLock<Vec<RegisteredHandler>>,
    next_handle: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
}

impl MemoryRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            impls: RwLock::new(BTreeMap::new()),
            by_handle: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Register an implementation under its fully-qualified name.
    ///
    /// Registering a name that already exists is a no-op returning the
    /// existing handle.
    pub fn register(&self, impl_name: &str) -> Result<ImplHandle, NameError> {
        let name = ImplName::parse(impl_name)?;
        let mut impls = self.impls.write();
        if let Some(record) = impls.get(name.as_str()) {
            return Ok(ImplHandle::from_raw(record.handle));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        impls.insert(
            name.as_str().to_string(),
            ImplRecord { handle, refs: 0 },
        );
        self.by_handle.insert(handle, name.as_str().to_string());
        Ok(ImplHandle::from_raw(handle))
    }

    /// Remove an implementation from the registry.
    ///
    /// Returns `true` if the name was registered. Outstanding references are
    /// not waited for; the loader is responsible for draining them first.
    pub fn unregister(&self, impl_name: &str) -> bool {
        let mut impls = self.impls.write();
        match impls.remove(impl_name) {
            Some(record) => {
                self.by_handle.remove(&record.handle);
                true
            }
            None => false,
        }
    }

    /// Register a load/unload notification handler under `impl_name`.
    ///
    /// The handler's name is also registered as an implementation record, so
    /// it is visible to iteration like any other implementation of the notify
    /// service.
    pub fn add_handler(
        &self,
        impl_name: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), NameError> {
        let name = ImplName::parse(impl_name)?;
        self.register(impl_name)?;
        self.handlers.write().push(RegisteredHandler { name, handler });
        Ok(())
    }

    /// Remove a previously registered notification handler.
    ///
    /// Returns `true` if a handler with that name was present.
    pub fn remove_handler(&self, impl_name: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.name.as_str() != impl_name);
        handlers.len() != before
    }

    /// Number of outstanding references for an implementation
    pub fn outstanding(&self, impl_name: &str) -> u64 {
        self.impls
            .read()
            .get(impl_name)
            .map(|r| r.refs)
            .unwrap_or(0)
    }

    /// Total acquire calls that succeeded since creation
    pub fn total_acquires(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }

    /// Total release calls since creation
    pub fn total_releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Number of registered implementations
    pub fn len(&self) -> usize {
        self.impls.read().len()
    }

    /// Check if the registry has no implementations
    pub fn is_empty(&self) -> bool {
        self.impls.read().is_empty()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry for MemoryRegistry {
    fn acquire(&self, impl_name: &str) -> Result<ImplHandle, RegistryError> {
        let mut impls = self.impls.write();
        let record = impls
            .get_mut(impl_name)
            .ok_or_else(|| RegistryError::NotFound(impl_name.to_string()))?;
        record.refs += 1;
        self.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(ImplHandle::from_raw(record.handle))
    }

    fn release(&self, handle: ImplHandle) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        let Some(name) = self.by_handle.get(&handle.as_raw()).map(|e| e.value().clone()) else {
            return;
        };
        let mut impls = self.impls.write();
        if let Some(record) = impls.get_mut(&name) {
            record.refs = record.refs.saturating_sub(1);
        }
    }

    fn iterate(&self, service: &str) -> Result<Box<dyn RegistryIter + '_>, RegistryError> {
        // Snapshot every name from the first entry of `service` onward; the
        // consumer stops at the first foreign prefix.
        let start = format!("{service}.");
        let names: Vec<String> = self
            .impls
            .read()
            .range(start..)
            .map(|(name, _)| name.clone())
            .collect();
        Ok(Box::new(MemoryIter { names, pos: 0 }))
    }

    fn notification_handlers(&self) -> Vec<RegisteredHandler> {
        self.handlers.read().clone()
    }
}

struct MemoryIter {
    names: Vec<String>,
    pos: usize,
}

impl RegistryIter for MemoryIter {
    fn next_name(&mut self) -> Result<Option<String>, RegistryError> {
        let name = self.names.get(self.pos).cloned();
        self.pos += 1;
        Ok(name)
    }
}
