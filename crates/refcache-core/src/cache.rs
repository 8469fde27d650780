//! Per-owner cache of acquired implementation handles
//!
//! A `RefCache` binds to one channel and materializes, per observed service,
//! the list of currently-acquired implementation handles. The channel's
//! version number guards the materialization: as long as it matches, `get`
//! is a slice lookup; once the channel is invalidated, the next `get`
//! releases everything and reacquires against the current registry state.
//!
//! Caches are single-owner by construction: every mutating operation takes
//! `&mut self`, so sharing one across threads requires handing the whole
//! cache over. The channel behind it is freely shared.

use std::collections::BTreeSet;
use std::sync::Arc;

use refcache_sdk::{ImplHandle, ServiceRegistry};

use crate::channel::ChannelRef;
use crate::error::{Error, Result};

/// `None` is the "nil row": the service produced no acquired handles.
type Row = Option<Vec<ImplHandle>>;

/// Cached, reference-counted view of one channel's services.
pub struct RefCache {
    channel: ChannelRef,
    registry: Arc<dyn ServiceRegistry>,
    /// Channel version captured at last materialization
    cache_version: u32,
    /// Service-name snapshot, sorted; index-stable for the cache's lifetime
    names: Box<[String]>,
    /// Ignore-list snapshot taken at last materialization
    ignore_snapshot: BTreeSet<String>,
    rows: Option<Box<[Row]>>,
    populated: bool,
}

impl RefCache {
    /// Bind a cache to a channel.
    ///
    /// Takes a strong reference to the channel for the cache's lifetime and
    /// snapshots its service-name set. Nothing is acquired until the first
    /// [`get`](RefCache::get).
    pub fn new(channel: ChannelRef) -> RefCache {
        let registry = Arc::clone(channel.registry());
        let names: Box<[String]> = channel.service_names().map(|n| n.to_string()).collect();
        let cache_version = channel.version();
        RefCache {
            channel,
            registry,
            cache_version,
            names,
            ignore_snapshot: BTreeSet::new(),
            rows: None,
            populated: false,
        }
    }

    /// The channel this cache is bound to
    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    /// Number of services the cache covers
    pub fn service_count(&self) -> usize {
        self.names.len()
    }

    /// Index of a service name within the cache's snapshot
    pub fn service_index(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok()
    }

    /// Whether the cache currently holds a materialization
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// The acquired-handle list for the service at `index`.
    ///
    /// Every returned handle carries an outstanding registry acquire, valid
    /// until the next mutating call on this cache. An empty slice means the
    /// service currently has no non-ignored implementations. If the channel
    /// version moved since the last materialization, all held references are
    /// released and the cache is rebuilt first.
    pub fn get(&mut self, index: usize) -> Result<&[ImplHandle]> {
        if index >= self.names.len() {
            return Err(Error::ServiceIndexOutOfRange {
                index,
                len: self.names.len(),
            });
        }
        let valid = self.cache_version == self.channel.version();
        if !(self.populated && valid) {
            self.flush();
            self.rematerialize();
        }
        Ok(self.row(index))
    }

    /// Release every held handle and drop the materialization. Idempotent.
    pub fn flush(&mut self) {
        if let Some(rows) = self.rows.take() {
            for row in rows.into_vec() {
                let Some(handles) = row else { continue };
                for handle in handles {
                    self.registry.release(handle);
                }
            }
        }
        self.populated = false;
    }

    fn row(&self, index: usize) -> &[ImplHandle] {
        match &self.rows {
            Some(rows) => rows[index].as_deref().unwrap_or(&[]),
            None => &[],
        }
    }

    /// Rebuild the rows against the current channel and registry state.
    ///
    /// Must only run on an empty cache (`flush` first). Snapshots the
    /// ignore-list and version before touching the registry, so a
    /// notification that lands mid-walk moves the channel version past the
    /// snapshot and the next `get` rebuilds again.
    fn rematerialize(&mut self) {
        debug_assert!(self.rows.is_none() && !self.populated);

        self.ignore_snapshot = self.channel.ignore_snapshot();
        self.cache_version = self.channel.version();

        let entries = self.channel.entries();
        // Fast path: nothing registered anywhere on this channel.
        if entries.iter().all(|e| e.implementation_count() == 0) {
            self.populated = true;
            return;
        }

        let mut rows: Vec<Row> = vec![None; self.names.len()];
        for (index, entry) in entries.iter().enumerate() {
            if entry.implementation_count() == 0 {
                continue;
            }
            let service = entry.name();
            // Iterator-creation failure reads as "no implementations".
            let Ok(mut iter) = self.registry.iterate(service) else {
                continue;
            };
            let mut acquired: Vec<ImplHandle> = Vec::new();
            loop {
                let full = match iter.next_name() {
                    Ok(Some(name)) => name,
                    // Exhausted, or the current name is unreadable: stop,
                    // keeping what this service already acquired.
                    Ok(None) | Err(_) => break,
                };
                let Some((found, suffix)) = full.split_once('.') else {
                    break;
                };
                if found != service {
                    // The iterator ran past this service's group.
                    break;
                }
                if self.ignore_snapshot.contains(suffix) {
                    continue;
                }
                // The implementation may have vanished between iteration
                // and acquisition; treat it as absent.
                let Ok(handle) = self.registry.acquire(&full) else {
                    continue;
                };
                if acquired.contains(&handle) {
                    // Duplicate yield from the iterator: drop the extra
                    // reference immediately.
                    self.registry.release(handle);
                } else {
                    acquired.push(handle);
                }
            }
            if !acquired.is_empty() {
                rows[index] = Some(acquired);
            }
        }
        self.rows = Some(rows.into_boxed_slice());
        self.populated = true;
    }
}

impl Drop for RefCache {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for RefCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCache")
            .field("services", &self.names)
            .field("cache_version", &self.cache_version)
            .field("populated", &self.populated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use parking_lot::Mutex;
    use refcache_sdk::{MemoryRegistry, RegistryError, RegistryIter};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn cache_over(names: &[&str], registry: Arc<dyn ServiceRegistry>) -> RefCache {
        let mut sorted: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        sorted.sort();
        let channel = Arc::new(Channel::new(sorted, registry));
        RefCache::new(ChannelRef::adopt(channel))
    }

    #[test]
    fn test_get_returns_acquired_handles() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("auth.basic").unwrap();
        registry.register("auth.ldap").unwrap();

        let mut cache = cache_over(&["auth"], registry.clone());
        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(registry.outstanding("auth.basic"), 1);
        assert_eq!(registry.outstanding("auth.ldap"), 1);
    }

    #[test]
    fn test_get_out_of_range() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut cache = cache_over(&["auth"], registry);
        assert_eq!(
            cache.get(1),
            Err(Error::ServiceIndexOutOfRange { index: 1, len: 1 })
        );
    }

    #[test]
    fn test_fast_path_skips_acquisition() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut cache = cache_over(&["auth", "log"], registry.clone());

        assert!(cache.get(0).unwrap().is_empty());
        assert!(cache.is_populated());
        assert_eq!(registry.total_acquires(), 0);
    }

    #[test]
    fn test_get_is_stable_while_version_holds() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("auth.basic").unwrap();

        let mut cache = cache_over(&["auth"], registry.clone());
        let first = cache.get(0).unwrap().as_ptr();
        let acquires = registry.total_acquires();

        let second = cache.get(0).unwrap().as_ptr();
        assert_eq!(first, second);
        assert_eq!(registry.total_acquires(), acquires);
    }

    #[test]
    fn test_invalidate_forces_rematerialization() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("auth.basic").unwrap();

        let mut cache = cache_over(&["auth"], registry.clone());
        cache.get(0).unwrap();
        assert_eq!(registry.total_acquires(), 1);

        cache.channel().invalidate();
        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        // Release-then-reacquire of an identical set.
        assert_eq!(registry.total_acquires(), 2);
        assert_eq!(registry.total_releases(), 1);
        assert_eq!(registry.outstanding("auth.basic"), 1);
    }

    #[test]
    fn test_ignore_snapshot_respected() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("auth.basic").unwrap();
        registry.register("auth.ldap").unwrap();

        let mut cache = cache_over(&["auth"], registry.clone());
        assert_eq!(cache.get(0).unwrap().len(), 2);

        cache.channel().ignore_add("basic");
        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(registry.outstanding("auth.basic"), 0);
        assert_eq!(registry.outstanding("auth.ldap"), 1);
    }

    #[test]
    fn test_flush_releases_and_is_idempotent() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("auth.basic").unwrap();

        let mut cache = cache_over(&["auth"], registry.clone());
        cache.get(0).unwrap();
        assert_eq!(registry.outstanding("auth.basic"), 1);

        cache.flush();
        assert_eq!(registry.outstanding("auth.basic"), 0);
        assert!(!cache.is_populated());

        cache.flush();
        assert_eq!(registry.total_releases(), 1);
    }

    #[test]
    fn test_drop_balances_acquires() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("auth.basic").unwrap();
        registry.register("auth.ldap").unwrap();
        registry.register("log.file").unwrap();

        {
            let mut cache = cache_over(&["auth", "log"], registry.clone());
            cache.get(0).unwrap();
            cache.get(1).unwrap();
            cache.channel().invalidate();
            cache.get(0).unwrap();
        }
        assert_eq!(registry.total_acquires(), registry.total_releases());
    }

    // ------------------------------------------------------------------
    // Scripted registry: replays a fixed iteration script so the edge
    // cases of the enumeration contract can be driven deterministically.
    // ------------------------------------------------------------------

    #[derive(Clone)]
    enum Event {
        Yield(&'static str),
        Fail,
    }

    struct ScriptedRegistry {
        events: Vec<Event>,
        refuse: Vec<&'static str>,
        fail_iterate: bool,
        handles: Mutex<HashMap<String, ImplHandle>>,
        next_handle: AtomicU64,
        acquires: AtomicU64,
        releases: AtomicU64,
    }

    impl ScriptedRegistry {
        fn new(events: Vec<Event>) -> Self {
            Self {
                events,
                refuse: Vec::new(),
                fail_iterate: false,
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                acquires: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            }
        }

        fn acquires(&self) -> u64 {
            self.acquires.load(Ordering::Relaxed)
        }

        fn releases(&self) -> u64 {
            self.releases.load(Ordering::Relaxed)
        }
    }

    impl ServiceRegistry for ScriptedRegistry {
        fn acquire(&self, impl_name: &str) -> std::result::Result<ImplHandle, RegistryError> {
            if self.refuse.contains(&impl_name) {
                return Err(RegistryError::NotFound(impl_name.to_string()));
            }
            let mut handles = self.handles.lock();
            let next = &self.next_handle;
            let handle = *handles
                .entry(impl_name.to_string())
                .or_insert_with(|| ImplHandle::from_raw(next.fetch_add(1, Ordering::Relaxed)));
            self.acquires.fetch_add(1, Ordering::Relaxed);
            Ok(handle)
        }

        fn release(&self, _handle: ImplHandle) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }

        fn iterate(
            &self,
            _service: &str,
        ) -> std::result::Result<Box<dyn RegistryIter + '_>, RegistryError> {
            if self.fail_iterate {
                return Err(RegistryError::Iteration("scripted failure".into()));
            }
            Ok(Box::new(ScriptIter {
                events: self.events.clone(),
                pos: 0,
            }))
        }

        fn notification_handlers(&self) -> Vec<refcache_sdk::RegisteredHandler> {
            Vec::new()
        }
    }

    struct ScriptIter {
        events: Vec<Event>,
        pos: usize,
    }

    impl RegistryIter for ScriptIter {
        fn next_name(&mut self) -> std::result::Result<Option<String>, RegistryError> {
            let event = self.events.get(self.pos).cloned();
            self.pos += 1;
            match event {
                Some(Event::Yield(name)) => Ok(Some(name.to_string())),
                Some(Event::Fail) => Err(RegistryError::Iteration("scripted failure".into())),
                None => Ok(None),
            }
        }
    }

    #[test]
    fn test_duplicate_yield_is_released_immediately() {
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Event::Yield("auth.pam"),
            Event::Yield("auth.pam"),
        ]));
        let mut cache = cache_over(&["auth"], registry.clone());

        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        // Two acquires, one immediate release: net one outstanding ref.
        assert_eq!(registry.acquires(), 2);
        assert_eq!(registry.releases(), 1);
    }

    #[test]
    fn test_iteration_stops_at_foreign_prefix() {
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Event::Yield("auth.pam"),
            Event::Yield("log.file"),
            Event::Yield("auth.late"),
        ]));
        let mut cache = cache_over(&["auth"], registry.clone());

        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        // Only auth.pam; log.file ends the group, auth.late is never seen.
        assert_eq!(registry.acquires(), 1);
    }

    #[test]
    fn test_iteration_error_keeps_prior_handles() {
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Event::Yield("auth.pam"),
            Event::Fail,
            Event::Yield("auth.late"),
        ]));
        let mut cache = cache_over(&["auth"], registry.clone());

        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(registry.acquires(), 1);
        assert_eq!(registry.releases(), 0);
    }

    #[test]
    fn test_unparsable_name_terminates_service() {
        let registry = Arc::new(ScriptedRegistry::new(vec![
            Event::Yield("auth.pam"),
            Event::Yield("garbage"),
            Event::Yield("auth.late"),
        ]));
        let mut cache = cache_over(&["auth"], registry.clone());

        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(registry.acquires(), 1);
    }

    #[test]
    fn test_iterator_creation_failure_leaves_row_empty() {
        let mut registry = ScriptedRegistry::new(vec![Event::Yield("auth.pam")]);
        registry.fail_iterate = true;
        // Force the slow path despite the iterate failure during the count
        // walk: the channel sees zero everywhere, so seed one entry by hand.
        let registry = Arc::new(registry);
        let channel = Arc::new(Channel::new(
            vec!["auth".to_string()],
            registry.clone(),
        ));
        channel.entries()[0].increment_count();

        let mut cache = RefCache::new(ChannelRef::adopt(channel));
        assert!(cache.get(0).unwrap().is_empty());
        assert!(cache.is_populated());
        assert_eq!(registry.acquires(), 0);
    }

    #[test]
    fn test_acquire_failure_skips_implementation() {
        let mut registry = ScriptedRegistry::new(vec![
            Event::Yield("auth.pam"),
            Event::Yield("auth.krb"),
        ]);
        registry.refuse = vec!["auth.pam"];
        let registry = Arc::new(registry);
        let mut cache = cache_over(&["auth"], registry.clone());

        let row = cache.get(0).unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(registry.acquires(), 1);
    }
}
