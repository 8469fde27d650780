//! Error types for the refcache core

use refcache_sdk::NameError;

/// Core subsystem errors
///
/// Deliberately flat: the original ABI collapsed every failure into a single
/// boolean, so callers that need that behavior can treat any `Err` as truthy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A channel must observe at least one service name
    #[error("Empty service-name set")]
    EmptyServiceSet,

    /// A service name failed validation
    #[error("Invalid service name: {0}")]
    InvalidServiceName(#[from] NameError),

    /// A live channel already observes an identical service-name set
    #[error("A live channel already observes this service set")]
    DuplicateChannel,

    /// The channel has strong references besides the caller's
    #[error("Channel is still referenced")]
    ChannelBusy,

    /// The channel is not (or no longer) registered with this subsystem
    #[error("Channel is not registered")]
    UnknownChannel,

    /// A cache `get` was called with an index past the channel's service set
    #[error("Service index {index} out of range ({len} services)")]
    ServiceIndexOutOfRange {
        /// The requested index
        index: usize,
        /// Number of services the channel observes
        len: usize,
    },
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
