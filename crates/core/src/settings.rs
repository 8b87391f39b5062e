//! Persisted client settings for the real-time agent session.
//!
//! Settings are read once through a [`SettingsStore`] and written back on
//! every mutation. Saved records are merged over the defaults so fields added
//! after a record was written still come back populated.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const DEFAULT_THEME_COLOR: &str = "sky";
pub const DEFAULT_AGENT_NAME: &str = "Interactive Avatar-v0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputToggles {
    pub camera: bool,
    pub screen: bool,
    pub mic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputToggles {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    pub theme_color: String,
    pub chat: bool,
    pub inputs: InputToggles,
    pub outputs: OutputToggles,
    pub ws_url: String,
    pub token: String,
    pub room_name: String,
    pub participant_id: String,
    pub participant_name: String,
    pub agent_name: Option<String>,
    pub metadata: Option<String>,
    pub attributes: Vec<AttributeItem>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            theme_color: DEFAULT_THEME_COLOR.to_string(),
            chat: true,
            inputs: InputToggles {
                camera: true,
                screen: true,
                mic: true,
            },
            outputs: OutputToggles {
                audio: true,
                video: true,
            },
            ws_url: String::new(),
            token: String::new(),
            room_name: String::new(),
            participant_id: String::new(),
            participant_name: String::new(),
            agent_name: Some(DEFAULT_AGENT_NAME.to_string()),
            metadata: Some(String::new()),
            attributes: Vec::new(),
        }
    }
}

impl SessionSettings {
    /// Defaults pointing at the configured real-time server.
    pub fn with_ws_url(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }

    /// Attributes as a key/value object, skipping blank keys.
    pub fn attribute_map(&self) -> Map<String, Value> {
        self.attributes
            .iter()
            .filter(|item| !item.key.trim().is_empty())
            .map(|item| (item.key.clone(), Value::String(item.value.clone())))
            .collect()
    }

    /// Overlay the top-level fields of a saved record onto `defaults`.
    pub fn merge_over(defaults: &Self, saved: Value) -> Result<Self> {
        let Value::Object(saved) = saved else {
            anyhow::bail!("saved settings are not a JSON object");
        };
        let mut merged = serde_json::to_value(defaults).context("failed to encode default settings")?;
        if let Value::Object(fields) = &mut merged {
            fields.extend(saved);
        }
        serde_json::from_value(merged).context("failed to decode saved settings")
    }
}

/// Load/save pair behind [`Settings`].
pub trait SettingsStore: Send + Sync {
    /// The raw saved record, `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Value>>;
    fn save(&self, settings: &SessionSettings) -> Result<()>;
}

/// Stores settings as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Option<Value>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings file: {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .with_context(|| format!("failed to parse settings file: {}", self.path.display()))
    }

    fn save(&self, settings: &SessionSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create settings directory: {}", parent.display())
            })?;
        }
        let encoded =
            serde_json::to_string_pretty(settings).context("failed to serialize settings")?;
        fs::write(&self.path, encoded)
            .with_context(|| format!("failed to write settings file: {}", self.path.display()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: Value) -> Self {
        Self {
            saved: Mutex::new(Some(record)),
        }
    }

    pub fn snapshot(&self) -> Option<Value> {
        self.saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Option<Value>> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &SessionSettings) -> Result<()> {
        let encoded = serde_json::to_value(settings).context("failed to serialize settings")?;
        *self
            .saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(encoded);
        Ok(())
    }
}

/// Settings loaded from a store; every mutation is written straight back.
pub struct Settings<S: SettingsStore> {
    current: SessionSettings,
    store: S,
}

impl<S: SettingsStore> Settings<S> {
    /// Read the saved record and merge it over `defaults`. An unreadable
    /// record is logged and replaced by the defaults.
    pub fn load(store: S, defaults: SessionSettings) -> Self {
        let current = match store.load() {
            Ok(Some(saved)) => SessionSettings::merge_over(&defaults, saved).unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "Ignoring unreadable session settings");
                defaults.clone()
            }),
            Ok(None) => defaults,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Failed to load session settings");
                defaults
            }
        };
        Self { current, store }
    }

    pub fn get(&self) -> &SessionSettings {
        &self.current
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn set(&mut self, settings: SessionSettings) -> Result<()> {
        self.store.save(&settings)?;
        self.current = settings;
        debug!("Session settings saved");
        Ok(())
    }

    pub fn update<F>(&mut self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut SessionSettings),
    {
        let mut next = self.current.clone();
        edit(&mut next);
        self.set(next)
    }
}
