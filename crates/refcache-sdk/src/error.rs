//! Error types for the refcache SDK contract

/// Errors produced when parsing or validating implementation names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name contains no `.` separator
    #[error("Missing '.' separator in implementation name: {0}")]
    MissingSeparator(String),

    /// The service portion before the `.` is empty
    #[error("Empty service name in: {0}")]
    EmptyService(String),

    /// The suffix portion after the `.` is empty
    #[error("Empty implementation suffix in: {0}")]
    EmptySuffix(String),

    /// The name contains more than one `.` (the separator is unique)
    #[error("More than one '.' separator in implementation name: {0}")]
    ExtraSeparator(String),

    /// The name contains non-ASCII bytes
    #[error("Non-ASCII implementation name: {0}")]
    NotAscii(String),
}

/// Errors produced by a service registry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No implementation is registered under the given name
    #[error("Implementation not found: {0}")]
    NotFound(String),

    /// The registry could not produce or advance an iterator
    #[error("Registry iteration failed: {0}")]
    Iteration(String),

    /// A user-level notification handler reported a failure
    #[error("Notification handler failed: {0}")]
    Handler(String),
}
