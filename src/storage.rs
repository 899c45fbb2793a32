//! File-backed pairing store.
//!
//! One JSON object at the root, keyed by the lowercase hex of the 16-byte
//! instance UID; each value holds the pairing slot index and the hex-encoded
//! 32-byte pairing key. A missing file is an empty store. Every successful
//! insert or remove is flushed so pairings survive a process restart.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::types::PairingInfo;
use crate::Result;

/// Durable mapping of card instance UID to pairing record.
pub struct PairingStore {
    path: PathBuf,
    pairings: BTreeMap<String, PairingInfo>,
    loaded: bool,
}

impl PairingStore {
    /// Create a store over the given file path. Nothing is read until the
    /// first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pairings: BTreeMap::new(),
            loaded: false,
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pairing for the given instance UID hex, if any.
    pub fn get(&mut self, instance_uid_hex: &str) -> Option<PairingInfo> {
        self.ensure_loaded();
        self.pairings.get(instance_uid_hex).cloned()
    }

    /// Insert or replace a pairing and flush to disk.
    pub fn put(&mut self, instance_uid_hex: &str, pairing: PairingInfo) -> Result<()> {
        self.ensure_loaded();
        self.pairings.insert(instance_uid_hex.to_string(), pairing);
        self.save()
    }

    /// Remove a pairing and flush to disk. Removing an absent entry is a
    /// no-op that still reports success.
    pub fn remove(&mut self, instance_uid_hex: &str) -> Result<()> {
        self.ensure_loaded();
        if self.pairings.remove(instance_uid_hex).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// All stored instance UIDs.
    pub fn instance_uids(&mut self) -> Vec<String> {
        self.ensure_loaded();
        self.pairings.keys().cloned().collect()
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no pairing file, starting fresh");
                return;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read pairing file");
                return;
            }
        };

        let root: Value = match serde_json::from_str(&raw) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) => {
                warn!(path = %self.path.display(), "pairing file root is not an object");
                return;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed pairing file");
                return;
            }
        };

        for (uid, entry) in root.as_object().unwrap() {
            // Unknown keys inside an entry are ignored by the deserializer;
            // malformed entries are skipped rather than failing the load.
            match serde_json::from_value::<PairingInfo>(entry.clone()) {
                Ok(pairing) => {
                    self.pairings.insert(uid.clone(), pairing);
                }
                Err(e) => {
                    warn!(uid = %uid, error = %e, "skipping malformed pairing entry");
                }
            }
        }
        debug!(count = self.pairings.len(), "pairings loaded");
    }

    // Write-then-rename so a concurrent reader never observes a torn file.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(&self.pairings)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(count = self.pairings.len(), path = %self.path.display(), "pairings saved");
        Ok(())
    }
}
