use std::fmt;

use crate::store::error::StoreError;

/// File extension that marks an entry as an installable, enabled plugin.
pub const ARCHIVE_EXTENSION: &str = ".jar";

pub const DEFAULT_DISABLED_SUFFIX: &str = ".disabled";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuffixError {
    #[error("disabled suffix cannot be empty")]
    Empty,
    #[error("disabled suffix cannot contain whitespace: {0:?}")]
    Whitespace(String),
    #[error("disabled suffix cannot be the archive extension .jar")]
    SameAsExtension,
    #[error("disabled suffix cannot end with .jar: {0:?}")]
    EndsWithExtension(String),
}

/// State of a store entry, derived from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Enabled,
    Disabled,
    Unrecognized,
}

impl EntryState {
    pub fn label(self) -> &'static str {
        match self {
            EntryState::Enabled => "enabled",
            EntryState::Disabled => "disabled",
            EntryState::Unrecognized => "other",
        }
    }
}

/// The enable/disable rule: a disabled plugin is its enabled file name with
/// the suffix appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    suffix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_DISABLED_SUFFIX.to_string(),
        }
    }
}

impl NamingConvention {
    pub fn new(raw: &str) -> Result<Self, SuffixError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SuffixError::Empty);
        }

        if trimmed.chars().any(char::is_whitespace) {
            return Err(SuffixError::Whitespace(trimmed.to_string()));
        }

        let suffix = if trimmed.starts_with('.') {
            trimmed.to_string()
        } else {
            format!(".{trimmed}")
        };

        if suffix == ARCHIVE_EXTENSION {
            return Err(SuffixError::SameAsExtension);
        }
        // Otherwise an enabled plugin could classify as disabled.
        if suffix.ends_with(ARCHIVE_EXTENSION) {
            return Err(SuffixError::EndsWithExtension(suffix));
        }

        Ok(Self { suffix })
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn classify(&self, name: &str) -> EntryState {
        if name.ends_with(&self.suffix) {
            EntryState::Disabled
        } else if name.ends_with(ARCHIVE_EXTENSION) {
            EntryState::Enabled
        } else {
            EntryState::Unrecognized
        }
    }

    /// Name an enabled plugin takes once disabled.
    pub fn disabled_name(&self, name: &str) -> Result<String, StoreError> {
        if !name.ends_with(ARCHIVE_EXTENSION) {
            return Err(StoreError::InvalidState {
                name: name.to_string(),
                reason: format!("expected a {ARCHIVE_EXTENSION} file"),
            });
        }

        Ok(format!("{name}{}", self.suffix))
    }

    /// Name a disabled plugin takes once enabled.
    pub fn enabled_name(&self, name: &str) -> Result<String, StoreError> {
        match name.strip_suffix(self.suffix.as_str()) {
            Some(restored) if !restored.is_empty() => Ok(restored.to_string()),
            _ => Err(StoreError::InvalidState {
                name: name.to_string(),
                reason: format!("does not carry the disabled suffix {}", self.suffix),
            }),
        }
    }
}

impl fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix)
    }
}
