use std::path::{Path, PathBuf};

use log::{error, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::date::is_media_extension;
use crate::glob::{has_wildcard, Glob};
use crate::metadata::{Metadata, MetadataBackend};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("invalid condition {0:?}: '*' is not allowed when a value is specified")]
    WildcardWithValue(String),
    #[error("invalid condition {0:?}: empty key")]
    EmptyKey(String),
    #[error("invalid pattern {pattern:?}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{} is not a filename or directory", .0.display())]
    NotFound(PathBuf),
}

/// A with/without metadata condition.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `KEY`: the key is present
    Present(String),
    /// `KEY=VALUE`: the key is present with exactly this value
    Equals(String, String),
    /// `KEY*`: some present key matches the pattern
    KeyGlob(Glob),
}

impl Predicate {
    pub fn parse(text: &str) -> Result<Self, SelectError> {
        let (key, value) = match text.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (text, None),
        };
        if key.is_empty() {
            return Err(SelectError::EmptyKey(text.to_string()));
        }
        match value {
            Some(_) if key.contains('*') => Err(SelectError::WildcardWithValue(text.to_string())),
            Some(v) => Ok(Self::Equals(key.to_string(), v.to_string())),
            None if key.contains('*') => Glob::new(key)
                .map(Self::KeyGlob)
                .map_err(|source| SelectError::BadPattern {
                    pattern: key.to_string(),
                    source,
                }),
            None => Ok(Self::Present(key.to_string())),
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::Present(key) => metadata.contains_key(key),
            Self::Equals(key, value) => metadata.get(key) == Some(value),
            Self::KeyGlob(glob) => metadata.keys().any(|k| glob.is_match(k)),
        }
    }
}

/// `--file-types` entry: a plain suffix such as `.jpg`, or a glob on the
/// file name such as `*.jp*g`.
#[derive(Debug, Clone)]
enum TypeFilter {
    Suffix(String),
    Pattern(Glob),
}

impl TypeFilter {
    fn matches(&self, filename: &str) -> bool {
        match self {
            Self::Suffix(s) => filename.ends_with(s.as_str()),
            Self::Pattern(g) => g.is_match(filename),
        }
    }
}

/// File selection criteria shared by every command.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    file_types: Vec<TypeFilter>,
    with: Vec<Predicate>,
    without: Vec<Predicate>,
}

impl Selection {
    pub fn new(
        file_types: &[String],
        with_exif: &[String],
        without_exif: &[String],
    ) -> Result<Self, SelectError> {
        let file_types = file_types
            .iter()
            .map(|t| {
                if has_wildcard(t) {
                    Glob::new(t)
                        .map(TypeFilter::Pattern)
                        .map_err(|source| SelectError::BadPattern {
                            pattern: t.clone(),
                            source,
                        })
                } else {
                    Ok(TypeFilter::Suffix(t.clone()))
                }
            })
            .collect::<Result<_, _>>()?;
        let with = with_exif
            .iter()
            .map(|p| Predicate::parse(p))
            .collect::<Result<_, _>>()?;
        let without = without_exif
            .iter()
            .map(|p| Predicate::parse(p))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            file_types,
            with,
            without,
        })
    }

    /// Whether metadata has to be read to decide selection.
    pub fn needs_metadata(&self) -> bool {
        !self.with.is_empty() || !self.without.is_empty()
    }

    /// Extension and file-type checks, which need no metadata.
    pub fn accepts_name(&self, path: &Path) -> bool {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !is_media_extension(ext) {
            return false;
        }
        self.file_types.is_empty() || self.file_types.iter().any(|t| t.matches(filename))
    }

    /// No `without` condition matches and every `with` condition does.
    pub fn accepts_metadata(&self, metadata: &Metadata) -> bool {
        !self.without.iter().any(|p| p.matches(metadata))
            && self.with.iter().all(|p| p.matches(metadata))
    }

    /// Lazily walk `roots`, yielding qualifying files in traversal order.
    pub fn files<'a>(
        &'a self,
        roots: &'a [PathBuf],
        backend: &'a dyn MetadataBackend,
    ) -> Files<'a> {
        Files {
            selection: self,
            backend,
            roots: roots.iter(),
            walker: None,
            bad_roots: 0,
        }
    }

    fn qualifies(&self, path: &Path, backend: &dyn MetadataBackend) -> bool {
        if !self.accepts_name(path) {
            return false;
        }
        if !self.needs_metadata() {
            return true;
        }
        match backend.read(path) {
            Ok(metadata) => self.accepts_metadata(&metadata),
            Err(e) => {
                warn!("{}: cannot read metadata: {:#}", path.display(), e);
                false
            }
        }
    }
}

/// Single-pass iterator over selected files.
pub struct Files<'a> {
    selection: &'a Selection,
    backend: &'a dyn MetadataBackend,
    roots: std::slice::Iter<'a, PathBuf>,
    walker: Option<walkdir::IntoIter>,
    bad_roots: usize,
}

impl Files<'_> {
    /// Number of root arguments that were neither a file nor a directory.
    pub fn bad_roots(&self) -> usize {
        self.bad_roots
    }
}

impl Iterator for Files<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            if let Some(walker) = self.walker.as_mut() {
                match walker.next() {
                    Some(Ok(entry)) => {
                        if entry.file_type().is_file()
                            && self.selection.qualifies(entry.path(), self.backend)
                        {
                            return Some(entry.into_path());
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        warn!("{}", e);
                        continue;
                    }
                    None => self.walker = None,
                }
            }

            let root = self.roots.next()?;
            if root.is_file() {
                if self.selection.qualifies(root, self.backend) {
                    return Some(root.clone());
                }
            } else if root.is_dir() {
                self.walker = Some(WalkDir::new(root).into_iter());
            } else {
                error!("{}", SelectError::NotFound(root.clone()));
                self.bad_roots += 1;
            }
        }
    }
}
