// ABOUTME: Disk-backed envelope store for durable cache keys
// ABOUTME: Best-effort JSON files carrying a value plus its absolute expiry
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Flat-file persistence for the durable subset of cache keys.
//!
//! Each key maps to one JSON envelope file holding the encoded value and an
//! absolute expiry. Durability is best-effort: every failure here degrades to
//! a cache miss, never to a caller-visible error.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Envelope persisted per durable key
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    expires_at: DateTime<Utc>,
    value: Value,
}

/// Best-effort file store under a dedicated cache directory
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    dir: PathBuf,
}

impl DiskCacheStore {
    /// Open (and create if needed) the store directory.
    ///
    /// A directory that cannot be created still yields a store; every
    /// subsequent operation will just miss.
    #[must_use]
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(error) = fs::create_dir_all(&dir) {
            debug!(%error, dir = %dir.display(), "failed to create cache directory");
        }
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are lowercase identifiers plus ':' separators; map anything
        // else to '_' so the key never escapes the store directory.
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    /// Persist an envelope for `key`. Failures are logged and swallowed;
    /// this is the designated call site where durability degrades silently.
    pub fn store(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) {
        let envelope = Envelope {
            expires_at,
            value: value.clone(),
        };
        let path = self.path_for(key);
        let result = serde_json::to_vec(&envelope)
            .map_err(|e| e.to_string())
            .and_then(|bytes| fs::write(&path, bytes).map_err(|e| e.to_string()));
        if let Err(error) = result {
            debug!(key, %error, "failed to persist cache envelope");
        }
    }

    /// Load the envelope for `key` if present, decodable, and unexpired.
    ///
    /// Expired or corrupt envelopes are deleted opportunistically. The
    /// returned expiry is the one originally persisted, not a refreshed one.
    #[must_use]
    pub fn load(&self, key: &str) -> Option<(Value, DateTime<Utc>)> {
        let path = self.path_for(key);
        let bytes = fs::read(&path).ok()?;

        let Ok(envelope) = serde_json::from_slice::<Envelope>(&bytes) else {
            debug!(key, "deleting corrupt cache envelope");
            remove_quietly(&path);
            return None;
        };

        if Utc::now() >= envelope.expires_at {
            debug!(key, "deleting expired cache envelope");
            remove_quietly(&path);
            return None;
        }

        Some((envelope.value, envelope.expires_at))
    }

    /// Remove the envelope for `key`, if any
    pub fn remove(&self, key: &str) {
        remove_quietly(&self.path_for(key));
    }

    /// Remove every envelope in the store
    pub fn clear(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                remove_quietly(&path);
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), %error, "failed to remove cache envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_round_trip_preserves_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(dir.path());
        let expires_at = Utc::now() + Duration::seconds(60);

        store.store("settings", &serde_json::json!({"plan": "pro"}), expires_at);
        let (value, loaded_expiry) = store.load("settings").unwrap();
        assert_eq!(value["plan"], "pro");
        assert_eq!(loaded_expiry, expires_at);
    }

    #[test]
    fn test_expired_envelope_is_a_miss_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(dir.path());

        store.store("usage", &serde_json::json!(1), Utc::now() - Duration::seconds(1));
        assert!(store.load("usage").is_none());
        // Deleted on first load; still a miss afterwards.
        assert!(store.load("usage").is_none());
    }

    #[test]
    fn test_corrupt_envelope_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(dir.path());
        std::fs::write(dir.path().join("settings.json"), b"not json").unwrap();
        assert!(store.load("settings").is_none());
    }

    #[test]
    fn test_key_sanitization_stays_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(dir.path());
        store.store("../escape", &serde_json::json!(true), Utc::now() + Duration::seconds(60));
        assert!(store.load("../escape").is_some());
        assert!(dir.path().join("___escape.json").exists());
    }
}
