//! Service registry contract
//!
//! The registry is the component that maps service names to implementations
//! and reference-counts each implementation. Refcache never owns it; it is
//! consumed through the [`ServiceRegistry`] trait so that the real server
//! registry, or [`MemoryRegistry`](crate::memory::MemoryRegistry) in tests,
//! can be plugged in interchangeably.

use std::sync::Arc;

use crate::error::RegistryError;
use crate::name::ImplName;

/// Opaque token for an acquired implementation reference.
///
/// Handle equality is identity: the registry returns the same handle value
/// for every acquire of the same implementation, so consumers can detect
/// duplicates without inspecting the implementation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImplHandle(u64);

impl ImplHandle {
    /// Build a handle from its raw identity value (registry-side only)
    pub fn from_raw(raw: u64) -> Self {
        ImplHandle(raw)
    }

    /// The raw identity value
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Iterator over registered implementation names.
///
/// The registry enumerates implementations in service-grouped order. An
/// iterator opened for service `S` is positioned at the first implementation
/// of `S`, but it MAY keep yielding names from subsequent services once `S`'s
/// group is exhausted; consumers stop at the first name whose service prefix
/// differs.
pub trait RegistryIter {
    /// Advance to the next fully-qualified implementation name.
    ///
    /// `Ok(None)` means the registry is exhausted. `Err` means the current
    /// name could not be read; the consumer terminates iteration, keeping
    /// whatever it has already collected.
    fn next_name(&mut self) -> Result<Option<String>, RegistryError>;
}

/// A user-level load/unload notification handler registered in the registry.
#[derive(Clone)]
pub struct RegisteredHandler {
    /// The fully-qualified name the handler is registered under
    pub name: ImplName,
    /// The handler itself
    pub handler: Arc<dyn NotificationHandler>,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.name)
            .finish()
    }
}

/// Callback contract for dynamic-loader notifications.
///
/// The loader (through the refcache dispatcher) invokes `before_unload` for a
/// batch of implementations it is about to unload, and `after_load` for a
/// batch it has just loaded. Notifications are best-effort: a returned error
/// is logged by the dispatcher and never propagated.
pub trait NotificationHandler: Send + Sync {
    /// A batch of implementations is about to be unloaded
    fn before_unload(&self, impls: &[ImplName]) -> Result<(), RegistryError>;

    /// A batch of implementations has just been loaded
    fn after_load(&self, impls: &[ImplName]) -> Result<(), RegistryError>;
}

/// The component/service registry refcache runs against.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; refcache calls into the registry
/// from whatever thread owns a cache, and from the loader's notification
/// thread, concurrently.
pub trait ServiceRegistry: Send + Sync {
    /// Acquire a reference to the named implementation.
    ///
    /// Every successful acquire must be balanced by a [`release`] call.
    /// Acquiring the same implementation repeatedly yields the same handle
    /// value with an incremented reference count.
    ///
    /// [`release`]: ServiceRegistry::release
    fn acquire(&self, impl_name: &str) -> Result<ImplHandle, RegistryError>;

    /// Release one previously acquired reference.
    ///
    /// Unknown or stale handles are ignored; release never fails at this
    /// boundary.
    fn release(&self, handle: ImplHandle);

    /// Open an iterator positioned at the first implementation of `service`.
    ///
    /// See [`RegistryIter`] for the grouped-order contract. An error here is
    /// treated by consumers as "this service has no visible implementations".
    fn iterate(&self, service: &str) -> Result<Box<dyn RegistryIter + '_>, RegistryError>;

    /// The load/unload notification handlers currently registered under the
    /// well-known notify service.
    fn notification_handlers(&self) -> Vec<RegisteredHandler>;
}
