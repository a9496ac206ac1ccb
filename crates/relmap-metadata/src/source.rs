//! Configuration precedence.

use serde::{Deserialize, Serialize};

/// Who configured a piece of metadata.
///
/// The order is total: `Convention < DataAnnotation < Explicit`. A write
/// from a lower source than the one recorded is rejected; an equal or higher
/// source replaces the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigurationSource {
    /// Derived by a convention.
    Convention,
    /// Derived from an annotation on the mapped member.
    DataAnnotation,
    /// Set directly through the model builder.
    Explicit,
}

impl ConfigurationSource {
    /// Whether a write from `self` may replace a value set by `existing`.
    #[must_use]
    pub fn overrides(self, existing: ConfigurationSource) -> bool {
        self >= existing
    }
}

/// A value together with the source that configured it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configured<T> {
    value: T,
    source: Option<ConfigurationSource>,
}

impl<T: Clone + PartialEq> Configured<T> {
    /// An unconfigured default.
    pub const fn unset(value: T) -> Self {
        Self {
            value,
            source: None,
        }
    }

    /// A value configured by `source`.
    pub const fn new(value: T, source: ConfigurationSource) -> Self {
        Self {
            value,
            source: Some(source),
        }
    }

    /// Current value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Source of the current value, `None` if never configured.
    pub fn source(&self) -> Option<ConfigurationSource> {
        self.source
    }

    /// Try to set the value.
    ///
    /// Returns `Err(existing)` when `source` is lower than the recorded
    /// source, `Ok(true)` when the value changed and `Ok(false)` when it was
    /// already equal (the recorded source is still raised to `source`).
    pub fn set(&mut self, value: T, source: ConfigurationSource) -> Result<bool, ConfigurationSource> {
        if let Some(existing) = self.source {
            if !source.overrides(existing) {
                return Err(existing);
            }
        }
        self.source = Some(self.source.map_or(source, |s| s.max(source)));
        if self.value == value {
            return Ok(false);
        }
        self.value = value;
        Ok(true)
    }
}
