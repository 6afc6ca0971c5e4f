//! Immutable configuration snapshots.
//!
//! A [`ConfigurationSnapshot`] captures every recognized setting at a point
//! in time as an ordered string map. Snapshots are produced by the
//! [`ConfigWatcher`](crate::watcher::ConfigWatcher) on every detected file
//! change and are never mutated afterwards: reconciliation always works on
//! whole snapshots, comparing the newest one against the last applied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::keys;

/// An ordered, immutable map of configuration keys to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    entries: BTreeMap<String, String>,
}

impl ConfigurationSnapshot {
    /// Builds a snapshot from raw entries, resolving short key aliases.
    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries: keys::rename_aliases(entries),
        }
    }

    /// Parses properties-style text (`key=value`, `#` comments).
    ///
    /// Later occurrences of a key override earlier ones. Lines without an
    /// `=` separator are ignored.
    #[must_use]
    pub fn from_properties(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self::from_entries(entries)
    }

    /// Loads a snapshot from the properties file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_properties(&text))
    }

    /// Looks up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the value for `key`, or `default` when absent.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parses `key` as a boolean, falling back to `default` when absent
    /// or unparseable (any value other than `true`, case-insensitive,
    /// reads as `false`).
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map_or(default, |v| v.eq_ignore_ascii_case("true"))
    }

    /// Parses `key` as a millisecond count.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the value is present but
    /// not a non-negative integer.
    pub fn get_millis(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                reason: "expected a non-negative millisecond count".to_string(),
            }),
        }
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns all entries sharing `prefix`, with the prefix stripped.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }

    /// Returns `true` when the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns a copy of the snapshot with `overrides` merged on top.
    ///
    /// Override keys are alias-resolved first, so procedure callers can
    /// use the short forms (`broker`, `groupId`, ...).
    #[must_use]
    pub fn merged_with(&self, overrides: BTreeMap<String, String>) -> Self {
        let mut entries = self.entries.clone();
        entries.extend(keys::rename_aliases(overrides));
        Self { entries }
    }
}

/// Resolves the configuration file location.
///
/// Precedence: the `STREAMS_CONF_FILE` variable (full path), then
/// `STREAMS_CONF` (directory containing `streams.conf`), then
/// `./streams.conf`.
#[must_use]
pub fn resolve_config_path() -> PathBuf {
    if let Ok(file) = std::env::var(keys::CONF_FILE_ENV) {
        if !file.is_empty() {
            return PathBuf::from(file);
        }
    }
    if let Ok(dir) = std::env::var(keys::CONF_DIR_ENV) {
        if !dir.is_empty() {
            return Path::new(&dir).join(keys::CONF_FILE_NAME);
        }
    }
    PathBuf::from(keys::CONF_FILE_NAME)
}
