//! Implementation name parsing
//!
//! Implementations are identified by fully-qualified names of the form
//! `"<service>.<suffix>"`. The `.` is the unique separator: service names
//! never contain one, and names with more than one dot are rejected. All
//! names are ASCII.

use crate::error::NameError;

/// A validated, fully-qualified implementation name: `"<service>.<suffix>"`.
///
/// Ordering and hashing follow the full name, so sorted collections of
/// `ImplName` group by service naturally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImplName {
    full: String,
    dot: usize,
}

impl ImplName {
    /// Parse a fully-qualified implementation name.
    ///
    /// Rejects names without a `.`, with an empty service or suffix portion,
    /// with more than one `.`, or containing non-ASCII bytes.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        if !raw.is_ascii() {
            return Err(NameError::NotAscii(raw.to_string()));
        }
        let dot = raw
            .find('.')
            .ok_or_else(|| NameError::MissingSeparator(raw.to_string()))?;
        if dot == 0 {
            return Err(NameError::EmptyService(raw.to_string()));
        }
        let suffix = &raw[dot + 1..];
        if suffix.is_empty() {
            return Err(NameError::EmptySuffix(raw.to_string()));
        }
        if suffix.contains('.') {
            return Err(NameError::ExtraSeparator(raw.to_string()));
        }
        Ok(ImplName {
            full: raw.to_string(),
            dot,
        })
    }

    /// The full `"<service>.<suffix>"` name
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The service portion (before the `.`)
    pub fn service(&self) -> &str {
        &self.full[..self.dot]
    }

    /// The implementation suffix (after the `.`)
    pub fn suffix(&self) -> &str {
        &self.full[self.dot + 1..]
    }
}

impl std::fmt::Display for ImplName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl std::str::FromStr for ImplName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImplName::parse(s)
    }
}

/// Validate a bare service name: non-empty, ASCII, and free of the `.`
/// separator.
pub fn validate_service_name(name: &str) -> Result<(), NameError> {
    if !name.is_ascii() {
        return Err(NameError::NotAscii(name.to_string()));
    }
    if name.is_empty() {
        return Err(NameError::EmptyService(name.to_string()));
    }
    if name.contains('.') {
        return Err(NameError::ExtraSeparator(name.to_string()));
    }
    Ok(())
}
