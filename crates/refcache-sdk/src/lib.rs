//! Refcache SDK - Contract types for the reference-cache subsystem
//!
//! This crate provides the minimal types and traits a component registry or
//! dynamic loader needs in order to plug into refcache, without depending on
//! the full refcache-core machinery:
//!
//! - **Names**: parsing and validation of `"<service>.<suffix>"`
//!   implementation names (`name` module)
//! - **Registry contract**: the [`ServiceRegistry`] / [`RegistryIter`] traits
//!   and the opaque [`ImplHandle`] acquired-reference token (`registry` module)
//! - **Notifications**: the [`NotificationHandler`] trait invoked before the
//!   loader unloads implementations and after it loads them
//! - **MemoryRegistry**: a thread-safe in-process registry implementation for
//!   embedding and tests, with acquire/release instrumentation (`memory` module)
//!
//! # Example
//!
//! ```ignore
//! use refcache_sdk::{MemoryRegistry, ServiceRegistry};
//!
//! let registry = MemoryRegistry::new();
//! registry.register("auth.basic").unwrap();
//! registry.register("auth.ldap").unwrap();
//!
//! let handle = registry.acquire("auth.basic").unwrap();
//! // ... dispatch through the handle ...
//! registry.release(handle);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod memory;
pub mod name;
pub mod registry;

pub use error::{NameError, RegistryError};
pub use memory::MemoryRegistry;
pub use name::ImplName;
pub use registry::{
    ImplHandle, NotificationHandler, RegisteredHandler, RegistryIter, ServiceRegistry,
};
