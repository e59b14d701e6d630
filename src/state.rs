//! Key-value checkpoint storage over a single local JSON file.
//!
//! Every stage (Producer/Enricher/Merger) and the orchestrator's own global
//! state get one file each. Reads of a missing or unparsable file return an
//! empty map rather than an error; writes replace the whole file atomically
//! via a temp-file-then-rename so a crash mid-write can never leave a
//! half-written cache behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// The three checkpoint states a stage (or sub-method) can be in.
///
/// Serialized as lowercase strings so the on-disk cache reads the same way
/// regardless of which language wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Start,
    Finish,
    Error,
}

/// A single named JSON-file-backed key-value store.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole file. Missing file or parse error -> empty map; this
    /// mirrors `JsonFileStorage.retrieve_state` treating `FileNotFoundError`
    /// as an empty dict, generalized to any corruption.
    fn retrieve(&self) -> BTreeMap<String, Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        }
    }

    fn save(&self, data: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        // Sorted keys, indent 1, matching the reference `JsonFileStorage` format.
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(data, &mut ser)
            .with_context(|| format!("serializing cache state for {}", self.path.display()))?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &buf)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Gets a key and deserializes it as `T`. Returns `Ok(None)` if the key is
    /// absent; propagates only on deserialization failure of a *present*
    /// value, since a present-but-wrong-shape value is a programmer error,
    /// not ordinary cache absence.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let data = self.retrieve();
        match data.get(key) {
            None => Ok(None),
            Some(value) => {
                let parsed = serde_json::from_value(value.clone())
                    .with_context(|| format!("decoding cache key {key}"))?;
                Ok(Some(parsed))
            }
        }
    }

    /// Sets a key, load-mutate-save the whole file.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut data = self.retrieve();
        let encoded =
            serde_json::to_value(value).with_context(|| format!("encoding cache key {key}"))?;
        data.insert(key.to_string(), encoded);
        self.save(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_on_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("main.json"));
        assert_eq!(store.get::<CacheState>("global_state").unwrap(), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("main.json"));
        store.set("global_state", &CacheState::Start).unwrap();
        assert_eq!(
            store.get::<CacheState>("global_state").unwrap(),
            Some(CacheState::Start)
        );
    }

    #[test]
    fn corrupted_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.json");
        std::fs::write(&path, b"not json at all {{{").unwrap();
        let store = StateStore::new(&path);
        assert_eq!(store.get::<CacheState>("global_state").unwrap(), None);

        // A subsequent set should still succeed and overwrite cleanly.
        store.set("global_state", &CacheState::Finish).unwrap();
        assert_eq!(
            store.get::<CacheState>("global_state").unwrap(),
            Some(CacheState::Finish)
        );
    }

    #[test]
    fn unrelated_keys_survive_a_set() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("producer.json"));
        store.set("Producer", &CacheState::Start).unwrap();
        store.set("Producer.get_person", &CacheState::Finish).unwrap();
        assert_eq!(
            store.get::<CacheState>("Producer").unwrap(),
            Some(CacheState::Start)
        );
        assert_eq!(
            store.get::<CacheState>("Producer.get_person").unwrap(),
            Some(CacheState::Finish)
        );
    }
}
