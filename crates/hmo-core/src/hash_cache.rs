use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Legacy on-disk cache of content digests: a JSON object mapping absolute
/// path to hex SHA-256.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct HashCache {
    entries: BTreeMap<PathBuf, String>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cache file; a missing file is an empty cache.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid hash cache {}", path.display()))
    }

    /// Write through a temp file and rename so an interrupted save never
    /// leaves a truncated cache behind.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let temp_path = path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&temp_path)?);
            serde_json::to_writer_pretty(writer, self)?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn insert(&mut self, path: PathBuf, hash: String) {
        self.entries.insert(path, hash);
    }

    pub fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Take every entry of `other`, overriding ours.
    pub fn merge(&mut self, other: HashCache) {
        self.entries.extend(other.entries);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
