//! Channels: shared descriptors of a set of observed service names
//!
//! A channel is a long-lived identity for "the set of services this client
//! cares about" plus a mutable ignore-list of implementation suffixes. Caches
//! bind to a channel and use its version counter as a coherence token: any
//! mutation that could make cached content stale bumps the version, and every
//! cache derived from the channel rematerializes on next access.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use refcache_sdk::{RegistryIter, ServiceRegistry};

/// One observed service name plus its advisory implementation count.
///
/// The name is immutable for the channel's lifetime; the count tracks the
/// number of non-ignored implementations as last observed and exists only to
/// enable the cache's "nothing registered" fast path. Correctness never
/// depends on its exact value.
pub struct ServiceEntry {
    name: String,
    count: AtomicU32,
}

impl ServiceEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            count: AtomicU32::new(0),
        }
    }

    /// The service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advisory count of non-ignored implementations, as last observed
    pub fn implementation_count(&self) -> u32 {
        // Advisory: relaxed is sufficient, see struct docs.
        self.count.load(Ordering::Relaxed)
    }

    fn store_count(&self, count: u32) {
        self.count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn increment_count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_count(&self) {
        // Saturating: never drops below zero.
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }
}

impl std::fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("name", &self.name)
            .field("count", &self.implementation_count())
            .finish()
    }
}

/// A set of observed service names plus an ignore-list of implementation
/// suffixes.
///
/// # Thread Safety
///
/// Channels are shared freely between threads. The ignore-list is guarded by
/// a reader/writer lock; the version and reference counters are atomics. The
/// service-name set is immutable after construction (only each entry's
/// advisory count mutates).
pub struct Channel {
    /// Sorted by name, deduplicated, immutable after construction
    entries: Box<[ServiceEntry]>,
    /// Ignored implementation suffixes (the channel's own lock)
    ignore: RwLock<BTreeSet<String>>,
    /// Cache-coherence token; monotonically increasing
    version: AtomicU32,
    /// Strong-reference count, driven by `ChannelRef` clone/drop
    refs: AtomicU32,
    registry: Arc<dyn ServiceRegistry>,
}

impl Channel {
    /// Build a channel for an already-validated, sorted, deduplicated name
    /// set and take the initial implementation counts from the registry.
    pub(crate) fn new(names: Vec<String>, registry: Arc<dyn ServiceRegistry>) -> Channel {
        let entries: Box<[ServiceEntry]> = names.into_iter().map(ServiceEntry::new).collect();
        let channel = Channel {
            entries,
            ignore: RwLock::new(BTreeSet::new()),
            version: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            registry,
        };
        channel.refresh_counts(&BTreeSet::new());
        channel
    }

    /// The observed service entries, sorted by name
    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }

    /// The observed service names, sorted
    pub fn service_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.name())
    }

    /// Index of a service name within the channel's sorted set
    pub fn service_index(&self, name: &str) -> Option<usize> {
        self.entries.binary_search_by(|e| e.name().cmp(name)).ok()
    }

    /// Current version. Caches compare this against their snapshot to decide
    /// whether to rematerialize.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Current strong-reference count
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Unconditionally bump the version, invalidating every cache bound to
    /// this channel.
    pub fn invalidate(&self) {
        self.bump_version();
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Add an implementation suffix to the ignore-list.
    ///
    /// Refreshes the per-service counts against the registry and bumps the
    /// version. Returns `true` if the suffix was already ignored.
    pub fn ignore_add(&self, suffix: &str) -> bool {
        let mut ignore = self.ignore.write();
        let already = !ignore.insert(suffix.to_string());
        self.refresh_counts(&ignore);
        self.bump_version();
        already
    }

    /// Remove an implementation suffix from the ignore-list.
    ///
    /// If the set changed, refreshes the per-service counts and bumps the
    /// version. Returns `true` if the suffix was not in the list.
    pub fn ignore_remove(&self, suffix: &str) -> bool {
        let mut ignore = self.ignore.write();
        let absent = !ignore.remove(suffix);
        if !absent {
            self.refresh_counts(&ignore);
            self.bump_version();
        }
        absent
    }

    /// Empty the ignore-list.
    ///
    /// Returns `true` if there was nothing to clear.
    pub fn ignore_clear(&self) -> bool {
        let mut ignore = self.ignore.write();
        if ignore.is_empty() {
            return true;
        }
        ignore.clear();
        self.refresh_counts(&ignore);
        self.bump_version();
        false
    }

    /// Copy of the current ignore-list
    pub fn ignore_snapshot(&self) -> BTreeSet<String> {
        self.ignore.read().clone()
    }

    /// Check whether a suffix is currently ignored
    pub fn ignore_contains(&self, suffix: &str) -> bool {
        self.ignore.read().contains(suffix)
    }

    /// Dispatcher path for a before-unload notification: ignore each suffix
    /// and drop the advisory count. The version bump happens in the
    /// dispatcher, after this lock is released.
    pub(crate) fn notify_unload(&self, service: &str, suffixes: &[&str]) {
        let Some(index) = self.service_index(service) else {
            return;
        };
        let entry = &self.entries[index];
        let mut ignore = self.ignore.write();
        for suffix in suffixes {
            ignore.insert((*suffix).to_string());
            entry.decrement_count();
        }
    }

    /// Dispatcher path for an after-load notification: stop ignoring each
    /// suffix and raise the advisory count.
    pub(crate) fn notify_load(&self, service: &str, suffixes: &[&str]) {
        let Some(index) = self.service_index(service) else {
            return;
        };
        let entry = &self.entries[index];
        let mut ignore = self.ignore.write();
        for suffix in suffixes {
            ignore.remove(*suffix);
            entry.increment_count();
        }
    }

    /// Recompute every entry's advisory count by walking the registry with
    /// the given ignore-list.
    fn refresh_counts(&self, ignore: &BTreeSet<String>) {
        for entry in self.entries.iter() {
            let count = count_visible(self.registry.as_ref(), entry.name(), ignore);
            entry.store_count(count);
        }
    }

    pub(crate) fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    pub(crate) fn adopt_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("entries", &self.entries)
            .field("version", &self.version())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Count the registry's non-ignored implementations of one service.
fn count_visible(
    registry: &dyn ServiceRegistry,
    service: &str,
    ignore: &BTreeSet<String>,
) -> u32 {
    let mut iter: Box<dyn RegistryIter + '_> = match registry.iterate(service) {
        Ok(iter) => iter,
        Err(_) => return 0,
    };
    let mut count = 0;
    loop {
        let full = match iter.next_name() {
            Ok(Some(name)) => name,
            Ok(None) | Err(_) => break,
        };
        let Some((found_service, suffix)) = full.split_once('.') else {
            break;
        };
        if found_service != service {
            // The iterator has run past this service's group.
            break;
        }
        if !ignore.contains(suffix) {
            count += 1;
        }
    }
    count
}

/// Owning strong reference to a [`Channel`].
///
/// Cloning increments the channel's reference count; dropping decrements it.
/// `Subsystem::channel_destroy` succeeds only when the caller's `ChannelRef`
/// is the single outstanding reference.
pub struct ChannelRef {
    inner: Arc<Channel>,
}

impl ChannelRef {
    /// Take a new strong reference on an existing channel.
    pub(crate) fn adopt(inner: Arc<Channel>) -> Self {
        inner.adopt_ref();
        ChannelRef { inner }
    }

    /// Identity comparison: do both references point at the same channel?
    pub fn ptr_eq(a: &ChannelRef, b: &ChannelRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn shared(&self) -> &Arc<Channel> {
        &self.inner
    }
}

impl Clone for ChannelRef {
    fn clone(&self) -> Self {
        ChannelRef::adopt(Arc::clone(&self.inner))
    }
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        self.inner.drop_ref();
    }
}

impl Deref for ChannelRef {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.inner
    }
}

impl std::fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
