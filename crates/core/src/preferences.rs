//! Persisted audio and UI preferences.
//!
//! Preferences are read once at startup into an `AudioPreferences` value and
//! written back through `PreferenceStore::save` on every change. Values are
//! stored as stringified booleans under fixed keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub const PUSH_TO_TALK_KEY: &str = "pushToTalkUI";
pub const LOGS_EXPANDED_KEY: &str = "logsExpanded";
pub const AUDIO_PLAYBACK_KEY: &str = "audioPlaybackEnabled";

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("Failed to access preference file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Preference file {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed string storage.
pub trait PreferenceStore: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn save(&self, key: &str, value: &str) -> Result<(), PreferenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPreferences {
    pub push_to_talk_enabled: bool,
    pub playback_enabled: bool,
    pub logs_expanded: bool,
}

impl Default for AudioPreferences {
    fn default() -> Self {
        Self {
            push_to_talk_enabled: false,
            playback_enabled: true,
            logs_expanded: true,
        }
    }
}

impl AudioPreferences {
    /// Reads all three keys, keeping the default for absent or unparsable values.
    pub fn load(store: &dyn PreferenceStore) -> Self {
        let defaults = Self::default();
        Self {
            push_to_talk_enabled: read_bool(store, PUSH_TO_TALK_KEY)
                .unwrap_or(defaults.push_to_talk_enabled),
            playback_enabled: read_bool(store, AUDIO_PLAYBACK_KEY)
                .unwrap_or(defaults.playback_enabled),
            logs_expanded: read_bool(store, LOGS_EXPANDED_KEY).unwrap_or(defaults.logs_expanded),
        }
    }
}

fn read_bool(store: &dyn PreferenceStore, key: &str) -> Option<bool> {
    let raw = store.load(key)?;
    match raw.as_str() {
        "true" => Some(true),
        "false" => Some(false),
        other => {
            warn!(key, value = other, "Ignoring malformed preference value");
            None
        }
    }
}

/// Writes a boolean preference, logging instead of failing.
pub fn save_bool(store: &dyn PreferenceStore, key: &str, value: bool) {
    if let Err(e) = store.save(key, if value { "true" } else { "false" }) {
        warn!(key, error = %e, "Failed to persist preference");
    }
}

/// A preference store backed by a small JSON object on disk.
pub struct JsonFilePreferenceStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFilePreferenceStore {
    /// Opens the store, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PreferenceError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| PreferenceError::Format {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(PreferenceError::Io { path, source }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for JsonFilePreferenceStore {
    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        let text = serde_json::to_string_pretty(&*values).map_err(|source| {
            PreferenceError::Format {
                path: self.path.clone(),
                source,
            }
        })?;
        std::fs::write(&self.path, text).map_err(|source| PreferenceError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// A process-local store, useful for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
