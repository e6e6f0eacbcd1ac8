//! Named modes partitioning the universe of registered sources.

use std::sync::Arc;

/// An opaque name partitioning the sources a run loop will consult.
///
/// A source registered under a mode fires only while the loop is operating
/// in that mode. The [`common`](Mode::common) pseudo-mode registers a source
/// for every mode at once: whatever mode a pass runs in, common sources are
/// consulted alongside that mode's own.
///
/// Modes are cheap to clone and compare by name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Mode(Arc<str>);

const DEFAULT_MODE: &str = "default";
const COMMON_MODE: &str = "common";

impl Mode {
    /// Creates a mode with the given name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The mode used by `run` and `run_until` when none is named.
    #[must_use]
    pub fn default_mode() -> Self {
        Self::new(DEFAULT_MODE)
    }

    /// The pseudo-mode meaning "all modes simultaneously".
    #[must_use]
    pub fn common() -> Self {
        Self::new(COMMON_MODE)
    }

    /// Returns the mode's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }

    /// True for the common pseudo-mode.
    #[must_use]
    pub fn is_common(&self) -> bool {
        &*self.0 == COMMON_MODE
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::default_mode()
    }
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mode({})", self.0)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Mode {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_compare_by_name() {
        assert_eq!(Mode::new("default"), Mode::default_mode());
        assert_ne!(Mode::new("modal"), Mode::default_mode());
        assert!(Mode::common().is_common());
        assert!(!Mode::default_mode().is_common());
    }
}
