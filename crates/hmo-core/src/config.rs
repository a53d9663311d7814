use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::media::DEFAULT_NAME_FORMAT;

/// Directory layout used by `organize` when none is configured.
pub const DEFAULT_DIR_PATTERN: &str = "%Y/%b";

/// Settings read from `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Manifest database
    pub manifest: Option<PathBuf>,
    /// Worker count
    pub jobs: Option<usize>,
    pub rename: RenameConfig,
    pub organize: OrganizeConfig,
    pub cleanup: CleanupConfig,
    pub dedup: DedupConfig,
    /// Per-model detector command lines
    pub classifiers: HashMap<String, ClassifierConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenameConfig {
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrganizeConfig {
    pub media_root: Option<PathBuf>,
    pub dir_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// Legacy JSON digest cache
    pub cache: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub command: Vec<String>,
}

impl Config {
    /// `<config dir>/home-media-organizer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("home-media-organizer").join("config.toml"))
    }

    /// Load `explicit`, which must exist, or else the default file if present.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file {} does not exist", path.display());
                }
                Self::from_file(path)
            }
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn rename_format(&self) -> &str {
        self.rename.format.as_deref().unwrap_or(DEFAULT_NAME_FORMAT)
    }

    pub fn dir_pattern(&self) -> &str {
        self.organize
            .dir_pattern
            .as_deref()
            .unwrap_or(DEFAULT_DIR_PATTERN)
    }

    /// Model name to argument list.
    pub fn classifier_commands(&self) -> HashMap<String, Vec<String>> {
        self.classifiers
            .iter()
            .map(|(k, v)| (k.clone(), v.command.clone()))
            .collect()
    }
}
