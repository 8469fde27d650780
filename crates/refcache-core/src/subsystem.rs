//! Subsystem: the channel set, the by-name channel index, and their lock
//!
//! The original design kept the channel containers in process globals guarded
//! by one reader/writer lock. Here they are owned by a `Subsystem` value:
//! embedders create one per registry, and every entry point dispatches
//! through it. Teardown is `Drop`.

use std::sync::Arc;

use parking_lot::RwLock;
use refcache_sdk::name::validate_service_name;
use refcache_sdk::{ImplName, NotificationHandler, ServiceRegistry};
use rustc_hash::FxHashMap;

use crate::channel::{Channel, ChannelRef};
use crate::dispatcher::{self, Direction, SubsystemHandler};
use crate::error::{Error, Result};

/// Default fully-qualified name of the subsystem's own notification
/// dispatcher within the registry's notify service.
pub const DEFAULT_NOTIFY_IMPL: &str = "notify.refcache";

/// Tunable identity of a subsystem instance.
#[derive(Debug, Clone)]
pub struct SubsystemOptions {
    /// Name under which this subsystem's dispatcher is registered in the
    /// registry. The notification fan-out skips this name so that a
    /// registered dispatcher never re-enters itself.
    pub notify_impl: ImplName,
}

impl Default for SubsystemOptions {
    fn default() -> Self {
        Self {
            notify_impl: ImplName::parse(DEFAULT_NOTIFY_IMPL)
                .expect("default notify implementation name is valid"),
        }
    }
}

pub(crate) struct ChannelTables {
    /// Channels deduplicated by their full sorted service-name set.
    /// Membership holds a plain `Arc` and does not contribute to the
    /// channel's reference count.
    pub(crate) set: FxHashMap<Box<[String]>, Arc<Channel>>,
    /// Multimap service name -> channels observing it; a channel appears
    /// once per name in its set.
    pub(crate) index: FxHashMap<String, Vec<Arc<Channel>>>,
}

/// Owner of all live channels for one service registry.
///
/// # Thread Safety
///
/// All operations take `&self`; the channel tables are guarded by a
/// reader/writer lock which is always acquired before any per-channel lock,
/// never after.
pub struct Subsystem {
    pub(crate) registry: Arc<dyn ServiceRegistry>,
    pub(crate) tables: RwLock<ChannelTables>,
    pub(crate) options: SubsystemOptions,
}

impl Subsystem {
    /// Create a subsystem bound to a registry, with default options
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::with_options(registry, SubsystemOptions::default())
    }

    /// Create a subsystem bound to a registry
    pub fn with_options(registry: Arc<dyn ServiceRegistry>, options: SubsystemOptions) -> Self {
        Self {
            registry,
            tables: RwLock::new(ChannelTables {
                set: FxHashMap::default(),
                index: FxHashMap::default(),
            }),
            options,
        }
    }

    /// The registry this subsystem runs against
    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    /// This subsystem's options
    pub fn options(&self) -> &SubsystemOptions {
        &self.options
    }

    /// Create a channel observing the given service names.
    ///
    /// Names are validated, sorted, and deduplicated. Fails with
    /// [`Error::DuplicateChannel`] if a live channel already observes an
    /// identical set. On success the caller holds the channel's single
    /// strong reference.
    pub fn channel_create(&self, names: &[&str]) -> Result<ChannelRef> {
        let sorted = normalize_names(names)?;
        let key: Box<[String]> = sorted.clone().into_boxed_slice();

        let mut tables = self.tables.write();
        if tables.set.contains_key(&key) {
            return Err(Error::DuplicateChannel);
        }
        let channel = Arc::new(Channel::new(sorted, Arc::clone(&self.registry)));
        for entry in channel.entries() {
            tables
                .index
                .entry(entry.name().to_string())
                .or_default()
                .push(Arc::clone(&channel));
        }
        tables.set.insert(key, Arc::clone(&channel));
        log::debug!(
            "created channel over {} service(s)",
            channel.entries().len()
        );
        Ok(ChannelRef::adopt(channel))
    }

    /// Look up the live channel for an identical service-name set and take a
    /// new strong reference to it.
    pub fn channel_lookup(&self, names: &[&str]) -> Option<ChannelRef> {
        let sorted = normalize_names(names).ok()?;
        let key: Box<[String]> = sorted.into_boxed_slice();
        let tables = self.tables.read();
        tables
            .set
            .get(&key)
            .map(|channel| ChannelRef::adopt(Arc::clone(channel)))
    }

    /// Attempt to destroy a channel.
    ///
    /// Succeeds only while `channel` is the single outstanding strong
    /// reference; the channel is then removed from the set and the index.
    /// The caller's handle stays usable but detached, and the memory is
    /// reclaimed once it is dropped. Fails with [`Error::ChannelBusy`]
    /// (no side effects) while caches or other holders keep references, and
    /// with [`Error::UnknownChannel`] if the channel was already destroyed.
    pub fn channel_destroy(&self, channel: &ChannelRef) -> Result<()> {
        let mut tables = self.tables.write();

        let key: Box<[String]> = channel
            .service_names()
            .map(|n| n.to_string())
            .collect();
        match tables.set.get(&key) {
            Some(live) if Arc::ptr_eq(live, channel.shared()) => {}
            _ => return Err(Error::UnknownChannel),
        }
        // The table write lock excludes concurrent lookup/create, so the
        // count cannot grow between this check and the removal below.
        if channel.ref_count() != 1 {
            return Err(Error::ChannelBusy);
        }

        tables.set.remove(&key);
        for entry in channel.entries() {
            if let Some(list) = tables.index.get_mut(entry.name()) {
                list.retain(|c| !Arc::ptr_eq(c, channel.shared()));
                if list.is_empty() {
                    tables.index.remove(entry.name());
                }
            }
        }
        log::debug!("destroyed channel over {} service(s)", channel.entries().len());
        Ok(())
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.tables.read().set.len()
    }

    /// Check whether no channels are live (the teardown precondition of the
    /// original design)
    pub fn is_empty(&self) -> bool {
        self.tables.read().set.is_empty()
    }

    /// Dynamic-loader entry point: a batch of implementations is about to be
    /// unloaded.
    ///
    /// Each affected channel starts ignoring the implementations, drops its
    /// advisory counts, and has its version bumped so caches release their
    /// references on next access. User-level notification handlers are then
    /// invoked best-effort. Returns the number of channel updates applied.
    pub fn notify_before_unload(&self, impls: &[&str]) -> usize {
        dispatcher::dispatch(self, impls, Direction::Unload)
    }

    /// Dynamic-loader entry point: a batch of implementations has just been
    /// loaded.
    ///
    /// The mirror image of [`notify_before_unload`]: affected channels stop
    /// ignoring the implementations and raise their advisory counts, so any
    /// ignore-list entries left behind by an aborted unload are cleaned up
    /// here. Returns the number of channel updates applied.
    ///
    /// [`notify_before_unload`]: Subsystem::notify_before_unload
    pub fn notify_after_load(&self, impls: &[&str]) -> usize {
        dispatcher::dispatch(self, impls, Direction::Load)
    }

    /// Adapter for registering this subsystem's dispatcher in the registry
    /// under `options.notify_impl`, so a loader that fans out through the
    /// registry reaches it like any other handler. The fan-out's skip rule
    /// keeps the registered adapter from re-entering itself.
    pub fn notification_handler(subsystem: &Arc<Subsystem>) -> Arc<dyn NotificationHandler> {
        Arc::new(SubsystemHandler {
            subsystem: Arc::clone(subsystem),
        })
    }
}

impl std::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystem")
            .field("channels", &self.channel_count())
            .field("notify_impl", &self.options.notify_impl)
            .finish()
    }
}

/// Validate, sort, and deduplicate a service-name set.
fn normalize_names(names: &[&str]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Err(Error::EmptyServiceSet);
    }
    let mut sorted: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        validate_service_name(name)?;
        sorted.push((*name).to_string());
    }
    sorted.sort();
    sorted.dedup();
    Ok(sorted)
}
