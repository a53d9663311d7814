use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::classify::Detection;

/// Tag name to tag metadata, e.g. `{"baby": {"model": "age", "age": 2}}`.
pub type TagMap = serde_json::Map<String, Value>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS manifest (
    absolute_path TEXT PRIMARY KEY,
    content_hash TEXT,
    tags JSON
);
CREATE TABLE IF NOT EXISTS classification (
    absolute_path TEXT NOT NULL,
    model TEXT NOT NULL,
    backend TEXT NOT NULL,
    detections JSON NOT NULL,
    PRIMARY KEY (absolute_path, model, backend)
);
"#;

/// One row of the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub hash: Option<String>,
    pub tags: TagMap,
}

/// Persistent per-file record of content hash and tags, kept in SQLite.
///
/// Every path is made absolute before use, so `a.jpg` and `/cwd/a.jpg` name
/// the same record. Each write runs in its own immediate transaction.
pub struct Manifest {
    conn: Mutex<Connection>,
    cache: Mutex<HashMap<PathBuf, Option<ManifestEntry>>>,
}

impl Manifest {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open manifest {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Full record for `path`, if one exists.
    pub fn get(&self, path: &Path) -> anyhow::Result<Option<ManifestEntry>> {
        let key = absolute(path)?;
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        // the row is cached before the connection is released so a
        // concurrent write cannot slip in between and be shadowed
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT absolute_path, content_hash, tags FROM manifest WHERE absolute_path = ?1",
                [path_text(&key)],
                row_to_entry,
            )
            .optional()?;
        self.cache.lock().unwrap().insert(key, entry.clone());
        Ok(entry)
    }

    pub fn get_hash(&self, path: &Path) -> anyhow::Result<Option<String>> {
        Ok(self.get(path)?.and_then(|e| e.hash))
    }

    pub fn set_hash(&self, path: &Path, hash: &str) -> anyhow::Result<()> {
        self.write(path, |tx, key| {
            tx.execute(
                "INSERT INTO manifest (absolute_path, content_hash) VALUES (?1, ?2)
                 ON CONFLICT(absolute_path) DO UPDATE SET content_hash = excluded.content_hash",
                params![key, hash],
            )?;
            Ok(())
        })
    }

    /// Tags of `path`; empty when there is no record.
    pub fn get_tags(&self, path: &Path) -> anyhow::Result<TagMap> {
        Ok(self.get(path)?.map(|e| e.tags).unwrap_or_default())
    }

    /// Merge `tags` into the existing tags. A tag already present gets its
    /// metadata replaced as a whole.
    pub fn add_tags(&self, path: &Path, tags: &TagMap) -> anyhow::Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let updates = tags
            .iter()
            .map(|(name, value)| Ok((json_path(name)?, serde_json::to_string(value)?)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.write(path, |tx, key| {
            tx.execute(
                "INSERT INTO manifest (absolute_path) VALUES (?1) ON CONFLICT(absolute_path) DO NOTHING",
                [key],
            )?;
            let mut stmt = tx.prepare(
                "UPDATE manifest SET tags = json_set(COALESCE(tags, '{}'), ?2, json(?3))
                 WHERE absolute_path = ?1",
            )?;
            for (name, value) in &updates {
                stmt.execute(params![key, name, value])?;
            }
            Ok(())
        })
    }

    /// Replace all tags of `path`; an empty map clears them.
    pub fn set_tags(&self, path: &Path, tags: &TagMap) -> anyhow::Result<()> {
        let value = serde_json::to_string(tags)?;
        self.write(path, |tx, key| {
            tx.execute(
                "INSERT INTO manifest (absolute_path, tags) VALUES (?1, json(?2))
                 ON CONFLICT(absolute_path) DO UPDATE SET tags = excluded.tags",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Remove the named tags; names that are not present are ignored.
    pub fn remove_tags(&self, path: &Path, names: &[String]) -> anyhow::Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let paths = names
            .iter()
            .map(|n| json_path(n))
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.write(path, |tx, key| {
            let mut stmt = tx.prepare(
                "UPDATE manifest SET tags = json_remove(tags, ?2)
                 WHERE absolute_path = ?1 AND tags IS NOT NULL",
            )?;
            for p in &paths {
                stmt.execute(params![key, p])?;
            }
            Ok(())
        })
    }

    /// Records carrying any of `names`, ordered by path. With no names, every
    /// record that has a tag mapping.
    pub fn find_by_tags(&self, names: &[String]) -> anyhow::Result<Vec<ManifestEntry>> {
        let conn = self.conn.lock().unwrap();
        let entries = if names.is_empty() {
            let mut stmt = conn.prepare(
                "SELECT absolute_path, content_hash, tags FROM manifest
                 WHERE tags IS NOT NULL ORDER BY absolute_path",
            )?;
            let rows = stmt.query_map([], row_to_entry)?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "SELECT absolute_path, content_hash, tags FROM manifest
                 WHERE EXISTS (SELECT 1 FROM json_each(manifest.tags) WHERE json_each.key IN ({}))
                 ORDER BY absolute_path",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(names.iter()), row_to_entry)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        Ok(entries)
    }

    /// Move the record of `from` to `to`, replacing any record at `to`.
    /// Cached detections move along.
    pub fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        let to_key = absolute(to)?;
        let to_text = path_text(&to_key);
        self.write_with(from, Some(&to_key), |tx, key| {
            tx.execute("DELETE FROM classification WHERE absolute_path = ?1", [&to_text])?;
            tx.execute(
                "UPDATE classification SET absolute_path = ?2 WHERE absolute_path = ?1",
                params![key, to_text],
            )?;
            if tx.query_row(
                "SELECT COUNT(*) FROM manifest WHERE absolute_path = ?1",
                [key],
                |row| row.get::<_, i64>(0),
            )? == 0
            {
                return Ok(());
            }
            tx.execute("DELETE FROM manifest WHERE absolute_path = ?1", [&to_text])?;
            tx.execute(
                "UPDATE manifest SET absolute_path = ?2 WHERE absolute_path = ?1",
                params![key, to_text],
            )?;
            Ok(())
        })
    }

    /// Drop the record of `path`, e.g. after the file was deleted.
    pub fn forget(&self, path: &Path) -> anyhow::Result<()> {
        self.write(path, |tx, key| {
            tx.execute("DELETE FROM manifest WHERE absolute_path = ?1", [key])?;
            tx.execute("DELETE FROM classification WHERE absolute_path = ?1", [key])?;
            Ok(())
        })
    }

    /// Raw detections stored for `path` by a model run with `backend`.
    pub fn get_detections(
        &self,
        path: &Path,
        model: &str,
        backend: &str,
    ) -> anyhow::Result<Option<Vec<Detection>>> {
        let key = path_text(&absolute(path)?);
        let text: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT detections FROM classification
                 WHERE absolute_path = ?1 AND model = ?2 AND backend = ?3",
                params![key, model, backend],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            Some(t) => Ok(Some(serde_json::from_str(&t)?)),
            None => Ok(None),
        }
    }

    pub fn set_detections(
        &self,
        path: &Path,
        model: &str,
        backend: &str,
        detections: &[Detection],
    ) -> anyhow::Result<()> {
        let text = serde_json::to_string(detections)?;
        self.write(path, |tx, key| {
            tx.execute(
                "INSERT INTO classification (absolute_path, model, backend, detections)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(absolute_path, model, backend)
                 DO UPDATE SET detections = excluded.detections",
                params![key, model, backend, text],
            )?;
            Ok(())
        })
    }

    fn write<F>(&self, path: &Path, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&rusqlite::Transaction, &str) -> rusqlite::Result<()>,
    {
        self.write_with(path, None, f)
    }

    /// Run `f` in an immediate transaction and invalidate the cached records
    /// of `path` and `also` while the connection is still held.
    fn write_with<F>(&self, path: &Path, also: Option<&Path>, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&rusqlite::Transaction, &str) -> rusqlite::Result<()>,
    {
        let key = absolute(path)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        f(&tx, &path_text(&key))
            .with_context(|| format!("manifest update failed for {}", key.display()))?;
        tx.commit()?;
        let mut cache = self.cache.lock().unwrap();
        cache.remove(&key);
        if let Some(other) = also {
            cache.remove(other);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").finish_non_exhaustive()
    }
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("cannot resolve {}", path.display()))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// SQLite JSON path addressing a single top-level key.
fn json_path(name: &str) -> anyhow::Result<String> {
    if name.contains('"') {
        bail!("tag name {:?} must not contain '\"'", name);
    }
    Ok(format!("$.\"{}\"", name))
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ManifestEntry> {
    let path: String = row.get(0)?;
    let hash: Option<String> = row.get(1)?;
    let tags: Option<String> = row.get(2)?;
    let tags = tags
        .and_then(|t| serde_json::from_str::<Value>(&t).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();
    Ok(ManifestEntry {
        path: PathBuf::from(path),
        hash,
        tags,
    })
}
