//! Persistence of the last-bound peripheral.
//!
//! The registry stores a single string key through a [`KeyValueStore`].
//! Read failures and invalid stored values are logged and reported as
//! "nothing saved", so a corrupt store only ever costs a fresh scan.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::types::PeripheralId;

/// Key under which the bound peripheral id is stored.
pub const BOUND_PERIPHERAL_KEY: &str = "ble_midi.bound_peripheral";

// ── KeyValueStore ────────────────────────────────────────────────────────────

/// Durable string key/value storage.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Volatile store, for tests and for running without persistence.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate one entry.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.entries.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// A flat JSON object on disk: `{ "key": "value", … }`.
///
/// The file is re-read on every `get` and rewritten on every change so that
/// edits made by other processes are picked up.  Non-string values are
/// ignored.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Use `path`, creating parent directories if needed.  The file itself is
    /// created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, Value>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?
        {
            Value::Object(map) => Ok(map),
            other => Err(anyhow!(
                "{}: expected a JSON object, found {other}",
                self.path.display()
            )),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<()> {
        let text = serde_json::to_string_pretty(map)?;
        // Replace atomically.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Current map, or an empty one when the file is unreadable.
    fn read_map_or_empty(&self) -> Map<String, Value> {
        self.read_map().unwrap_or_else(|e| {
            warn!("store: {e:#}; starting from an empty map");
            Map::new()
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_map()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut map = self.read_map_or_empty();
        map.insert(key.to_owned(), Value::String(value.to_owned()));
        self.write_map(&map)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut map = self.read_map_or_empty();
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

// ── DeviceRegistry ───────────────────────────────────────────────────────────

/// Remembers which peripheral the user bound to, across restarts.
pub struct DeviceRegistry {
    store: Box<dyn KeyValueStore>,
}

impl DeviceRegistry {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Registry that forgets everything when dropped.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    /// The bound peripheral, or `None` when nothing valid is stored.
    pub fn load(&self) -> Option<PeripheralId> {
        let raw = match self.store.get(BOUND_PERIPHERAL_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("registry: could not read bound peripheral: {e:#}");
                return None;
            }
        };
        let id = PeripheralId::parse(raw.trim());
        if id.is_none() {
            warn!("registry: ignoring invalid stored peripheral id {raw:?}");
        }
        id
    }

    /// Persist `id` as the bound peripheral.  Failures are logged.
    pub fn save(&mut self, id: &PeripheralId) {
        match self.store.set(BOUND_PERIPHERAL_KEY, id.as_str()) {
            Ok(()) => info!("registry: bound peripheral {id}"),
            Err(e) => warn!("registry: could not save {id}: {e:#}"),
        }
    }

    /// Save `id` only when no valid peripheral is bound yet.
    ///
    /// Returns `true` when `id` is the bound peripheral afterwards.
    pub fn bind_if_unset(&mut self, id: &PeripheralId) -> bool {
        match self.load() {
            Some(bound) if &bound == id => true,
            Some(bound) => {
                debug!("registry: keeping bound peripheral {bound}, not rebinding to {id}");
                false
            }
            None => {
                self.save(id);
                true
            }
        }
    }

    /// Forget the bound peripheral.
    pub fn clear(&mut self) {
        match self.store.remove(BOUND_PERIPHERAL_KEY) {
            Ok(()) => info!("registry: bound peripheral cleared"),
            Err(e) => warn!("registry: could not clear bound peripheral: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeripheralId {
        PeripheralId::parse(s).unwrap()
    }

    #[test]
    fn empty_store_loads_nothing() {
        assert_eq!(DeviceRegistry::in_memory().load(), None);
    }

    #[test]
    fn save_then_load() {
        let mut reg = DeviceRegistry::in_memory();
        reg.save(&id("A1B2"));
        assert_eq!(reg.load(), Some(id("A1B2")));
        reg.clear();
        assert_eq!(reg.load(), None);
    }

    #[test]
    fn invalid_stored_value_is_absent() {
        let store = MemoryStore::new().with(BOUND_PERIPHERAL_KEY, "not an id");
        assert_eq!(DeviceRegistry::new(Box::new(store)).load(), None);
        let store = MemoryStore::new().with(BOUND_PERIPHERAL_KEY, "");
        assert_eq!(DeviceRegistry::new(Box::new(store)).load(), None);
    }

    #[test]
    fn first_bind_wins() {
        let mut reg = DeviceRegistry::in_memory();
        assert!(reg.bind_if_unset(&id("first")));
        assert!(reg.bind_if_unset(&id("first")));
        assert!(!reg.bind_if_unset(&id("second")));
        assert_eq!(reg.load(), Some(id("first")));
    }

    #[test]
    fn json_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.json");

        let mut reg = DeviceRegistry::new(Box::new(JsonFileStore::open(&path).unwrap()));
        assert_eq!(reg.load(), None);
        reg.save(&id("5D2C1C8A-6E57-4B0B-8F3E-1E6A3C2B9F10"));

        let reg = DeviceRegistry::new(Box::new(JsonFileStore::open(&path).unwrap()));
        assert_eq!(reg.load(), Some(id("5D2C1C8A-6E57-4B0B-8F3E-1E6A3C2B9F10")));
    }

    #[test]
    fn corrupt_file_reads_as_absent_and_is_replaced_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "{ not json").unwrap();

        let mut reg = DeviceRegistry::new(Box::new(JsonFileStore::open(&path).unwrap()));
        assert_eq!(reg.load(), None);
        reg.save(&id("dev-1"));
        assert_eq!(reg.load(), Some(id("dev-1")));
    }

    #[test]
    fn non_string_value_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, format!("{{\"{BOUND_PERIPHERAL_KEY}\": 42}}")).unwrap();
        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get(BOUND_PERIPHERAL_KEY).unwrap(), None);
    }
}
