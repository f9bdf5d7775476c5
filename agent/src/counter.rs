// Copyright (C) 2023 - Tillitis AB
// SPDX-License-Identifier: GPL-2.0-only

//! Host-maintained signature counters.
//!
//! The device is stateless, so the monotonic counter U2F wants in every
//! assertion has to live here. Counters are kept per key handle (keyed by
//! its hash) in a small JSON file under the user's data directory. If the
//! file cannot be written the store degrades to process-local counting
//! rather than blocking authentication.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use directories::ProjectDirs;
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Default, Deserialize, Serialize)]
struct Counters {
    counters: BTreeMap<String, u32>,
}

#[derive(Debug)]
pub struct CounterStore {
    path: Option<PathBuf>,
    state: Mutex<Counters>,
}

impl CounterStore {
    /// The persistent store under the user's data directory.
    pub fn open_default() -> Self {
        let path = ProjectDirs::from("se", "tillitis", "tkey-fido")
            .map(|dirs| dirs.data_dir().join("counters.json"));
        if path.is_none() {
            warn!("no data directory available, signature counters will not persist");
        }
        Self::open(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self::open(Some(path))
    }

    /// Process-local counters only.
    pub fn in_memory() -> Self {
        Self::open(None)
    }

    fn open(path: Option<PathBuf>) -> Self {
        let state = path
            .as_deref()
            .and_then(|path| fs::read(path).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Increment and return the counter for this key handle.
    pub fn next(&self, key_handle: &[u8]) -> u32 {
        let key = handle_key(key_handle);
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = state.counters.entry(key).or_insert(0);
        *counter += 1;
        let value = *counter;
        self.persist(&state);
        value
    }

    fn persist(&self, state: &Counters) {
        let Some(path) = &self.path else {
            return;
        };
        let result = (|| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = serde_json::to_vec_pretty(state)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            fs::write(path, bytes)
        })();
        if let Err(err) = result {
            warn!(
                "failed to persist signature counters to {}: {}",
                path.display(),
                err
            );
        }
    }
}

fn handle_key(key_handle: &[u8]) -> String {
    let digest = Sha256::digest(key_handle);
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(key, "{:02x}", byte);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_handle() {
        let store = CounterStore::in_memory();
        assert_eq!(store.next(&[1; 64]), 1);
        assert_eq!(store.next(&[1; 64]), 2);
        assert_eq!(store.next(&[2; 64]), 1);
        assert_eq!(store.next(&[1; 64]), 3);
    }

    #[test]
    fn persists_across_reopen() {
        let path = std::env::temp_dir().join(format!(
            "tkey-fido-counter-test-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let store = CounterStore::with_path(path.clone());
        assert_eq!(store.next(&[7; 64]), 1);
        assert_eq!(store.next(&[7; 64]), 2);
        drop(store);

        let store = CounterStore::with_path(path.clone());
        assert_eq!(store.next(&[7; 64]), 3);

        let _ = fs::remove_file(&path);
    }
}
