use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::RwLock;

use anyhow::{bail, Context};
use serde_json::Value;

use crate::glob::{has_wildcard, Glob};

/// Flat mapping of group-qualified keys (`EXIF:DateTimeOriginal`,
/// `QuickTime:MediaCreateDate`, `File:FileModifyDate`, ...) to values.
pub type Metadata = BTreeMap<String, String>;

/// Reads and writes embedded metadata of media files.
pub trait MetadataBackend: Send + Sync {
    fn read(&self, path: &Path) -> anyhow::Result<Metadata>;

    /// Write the given keys in one call.
    fn write(&self, path: &Path, tags: &Metadata) -> anyhow::Result<()>;
}

/// Metadata backend driving the `exiftool` command line program.
#[derive(Debug, Clone)]
pub struct ExifTool {
    program: PathBuf,
}

impl Default for ExifTool {
    fn default() -> Self {
        Self::new("exiftool")
    }
}

impl ExifTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Check if the program can be started.
    pub fn available(&self) -> bool {
        Command::new(&self.program)
            .arg("-ver")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl MetadataBackend for ExifTool {
    fn read(&self, path: &Path) -> anyhow::Result<Metadata> {
        let output = Command::new(&self.program)
            .arg("-j") // JSON output
            .arg("-G") // group names
            .arg(path)
            .output()
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{} failed on {}: {}",
                self.program.display(),
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let parsed: Vec<serde_json::Map<String, Value>> = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("unexpected exiftool output for {}", path.display()))?;
        let tags = parsed
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no metadata returned for {}", path.display()))?;

        Ok(tags
            .into_iter()
            .map(|(k, v)| (k, value_to_string(v)))
            .collect())
    }

    fn write(&self, path: &Path, tags: &Metadata) -> anyhow::Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new(&self.program);
        cmd.arg("-overwrite_original");
        for (k, v) in tags {
            cmd.arg(format!("-{}={}", k, v));
        }
        let output = cmd
            .arg(path)
            .output()
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "{} could not update {}: {}",
                self.program.display(),
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

fn value_to_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// In-memory backend keyed by absolute path. Unknown files have no metadata.
#[derive(Debug, Default)]
pub struct StaticBackend {
    entries: RwLock<HashMap<PathBuf, Metadata>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &Path, metadata: Metadata) {
        let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        self.entries.write().unwrap().insert(key, metadata);
    }
}

impl MetadataBackend for StaticBackend {
    fn read(&self, path: &Path) -> anyhow::Result<Metadata> {
        let key = std::path::absolute(path)?;
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn write(&self, path: &Path, tags: &Metadata) -> anyhow::Result<()> {
        let key = std::path::absolute(path)?;
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key).or_default();
        for (k, v) in tags {
            entry.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

/// Restrict metadata to the requested keys for display.
///
/// Without wildcards every requested key is shown, with `NA` for missing
/// ones. If any key contains a wildcard, present keys matching any of the
/// patterns are shown instead.
pub fn select_keys(metadata: &Metadata, keys: &[String]) -> anyhow::Result<Metadata> {
    if keys.is_empty() {
        return Ok(metadata.clone());
    }
    if !keys.iter().any(|k| has_wildcard(k)) {
        return Ok(keys
            .iter()
            .map(|k| {
                let v = metadata.get(k).cloned().unwrap_or_else(|| "NA".to_string());
                (k.clone(), v)
            })
            .collect());
    }

    let globs = keys
        .iter()
        .map(|k| Glob::new(k).with_context(|| format!("invalid key pattern {:?}", k)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(metadata
        .iter()
        .filter(|(k, _)| globs.iter().any(|g| g.is_match(k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        [
            ("EXIF:DateTimeOriginal", "2022:01:01 12:00:00"),
            ("EXIF:Make", "Canon"),
            ("File:FileSize", "12 kB"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_select_exact_keys() {
        let keys = vec!["EXIF:Make".to_string(), "EXIF:Model".to_string()];
        let selected = select_keys(&sample(), &keys).unwrap();
        assert_eq!(selected.get("EXIF:Make").map(String::as_str), Some("Canon"));
        assert_eq!(selected.get("EXIF:Model").map(String::as_str), Some("NA"));
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_select_wildcard_keys() {
        let keys = vec!["EXIF:*".to_string()];
        let selected = select_keys(&sample(), &keys).unwrap();
        assert_eq!(selected.len(), 2);
        assert!(!selected.contains_key("File:FileSize"));
    }

    #[test]
    fn test_static_backend_round_trip() {
        let backend = StaticBackend::new();
        let path = Path::new("/library/a.jpg");
        assert!(backend.read(path).unwrap().is_empty());

        backend.insert(path, sample());
        let mut update = Metadata::new();
        update.insert("EXIF:Make".to_string(), "Nikon".to_string());
        backend.write(path, &update).unwrap();

        let read = backend.read(path).unwrap();
        assert_eq!(read.get("EXIF:Make").map(String::as_str), Some("Nikon"));
        assert_eq!(read.len(), 3);
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(Value::String("x".into())), "x");
        assert_eq!(value_to_string(serde_json::json!(12)), "12");
    }
}
