// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Persists the boot config of every display in one JSON file, keyed by
/// display id. A cleared entry is stored as an empty string.
#[derive(Debug)]
pub struct BootConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BootConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the stored config for a display. Missing, empty or
    /// unparseable entries read as unset.
    pub fn get(&self, display_id: u64) -> Option<i32> {
        let _guard = self.lock.lock();
        let entries = match self.read() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, path = ?self.path, "failed to read boot config");
                return None;
            }
        };

        let value = entries.get(&display_id.to_string())?;
        if value.is_empty() {
            return None;
        }

        match value.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(display_id, value, "ignoring invalid boot config");
                None
            }
        }
    }

    /// Stores a config for a display, or clears it.
    pub fn set(&self, display_id: u64, config_id: Option<i32>) -> anyhow::Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read()?;
        entries.insert(
            display_id.to_string(),
            config_id.map(|id| id.to_string()).unwrap_or_default(),
        );

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("tmp");
        let contents = serde_json::to_vec_pretty(&entries)?;
        std::fs::write(&tmp, contents)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(display_id, ?config_id, "saved boot config");
        Ok(())
    }

    fn read(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let contents = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        serde_json::from_slice(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }
}
