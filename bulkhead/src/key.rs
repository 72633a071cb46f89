//! # Pool Keys
//!
//! A [`PoolKey`] names one bulkhead. Every registry in this crate is keyed by
//! the key's *name*, so two keys built from the same string always resolve to
//! the same pool no matter how many times they are constructed.

use std::fmt;
use std::sync::Arc;

/// Identity of an isolation pool.
///
/// Equality and hashing are by name only.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    name: Arc<str>,
}

impl PoolKey {
    /// Create a key for the given pool name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
        }
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolKey").field(&self.name()).finish()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for PoolKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PoolKey {
    fn from(name: String) -> Self {
        Self {
            name: Arc::from(name),
        }
    }
}

impl AsRef<str> for PoolKey {
    fn as_ref(&self) -> &str {
        self.name()
    }
}
