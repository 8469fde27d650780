//! Refcache core - versioned reference caching for a dynamic component registry
//!
//! The server's component registry maps service names to implementations and
//! reference-counts every implementation. Clients that dispatch to *every*
//! implementation of a service cannot afford a registry walk plus
//! acquire/release per call, but the implementation set changes at runtime as
//! the dynamic loader moves components in and out. This crate amortizes the
//! cost:
//!
//! - **Channel** (`channel` module): a shared descriptor of the service names
//!   a client observes plus an ignore-list of implementation suffixes, with a
//!   monotonically increasing version acting as a cache-coherence token
//! - **Subsystem** (`subsystem` module): owner of all live channels, their
//!   dedup set, and the by-name index the dispatcher walks
//! - **RefCache** (`cache` module): a single-owner materialization of a
//!   channel's current registry view, holding one acquired reference per
//!   visible implementation
//! - **Dispatcher** (internal): translates the loader's before-unload /
//!   after-load notifications into channel mutations and fans them out to
//!   user-level handlers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use refcache_core::{RefCache, Subsystem};
//! use refcache_sdk::MemoryRegistry;
//!
//! let registry = Arc::new(MemoryRegistry::new());
//! registry.register("auth.basic")?;
//!
//! let subsystem = Subsystem::new(registry.clone());
//! let channel = subsystem.channel_create(&["auth"])?;
//!
//! let mut cache = RefCache::new(channel.clone());
//! for handle in cache.get(0)? {
//!     // dispatch through `handle`; the reference is held by the cache
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod channel;
mod dispatcher;
pub mod error;
pub mod subsystem;

pub use cache::RefCache;
pub use channel::{Channel, ChannelRef, ServiceEntry};
pub use error::{Error, Result};
pub use subsystem::{Subsystem, SubsystemOptions, DEFAULT_NOTIFY_IMPL};

// Re-export the contract crate so embedders see one coherent surface
// (canonical definitions live in refcache-sdk).
pub use refcache_sdk as sdk;
pub use refcache_sdk::{ImplHandle, ImplName, NotificationHandler, ServiceRegistry};
