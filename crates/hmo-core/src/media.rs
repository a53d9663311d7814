use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, OnceLock};

use anyhow::Context;
use filetime::FileTime;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::date::{DateLabel, DateResolver};

const CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Default rename format, which is also the native date label layout.
pub const DEFAULT_NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

static NAME_OK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^2\d{7}(_.*)?$").unwrap());

/// A media file on disk with lazily derived attributes.
///
/// The date label and content hash are computed on first use and kept for the
/// lifetime of the value; construct a new `MediaFile` to re-derive them.
#[derive(Debug)]
pub struct MediaFile {
    /// Absolute path
    path: PathBuf,
    /// Directory containing the file
    dirname: PathBuf,
    /// Just the filename
    filename: String,
    /// Extension as written, without the dot
    ext: String,
    date: OnceLock<DateLabel>,
    hash: OnceLock<String>,
}

impl MediaFile {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = std::path::absolute(path.as_ref())
            .with_context(|| format!("cannot resolve {}", path.as_ref().display()))?;
        let dirname = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("{} has no usable file name", path.display()))?
            .to_string();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        Ok(Self {
            path,
            dirname,
            filename,
            ext,
            date: OnceLock::new(),
            hash: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn size(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Canonical date label, resolved once.
    pub fn date(&self, resolver: &DateResolver) -> &DateLabel {
        self.date.get_or_init(|| resolver.resolve(&self.path))
    }

    /// SHA-256 of the file content, computed once.
    pub fn hash(&self) -> io::Result<&str> {
        if let Some(h) = self.hash.get() {
            return Ok(h);
        }
        let h = hash_file(&self.path)?;
        Ok(self.hash.get_or_init(|| h))
    }

    /// File name stem this file should carry, e.g. `20210615_143000`.
    pub fn intended_prefix(&self, resolver: &DateResolver, format: &str) -> anyhow::Result<String> {
        self.date(resolver).format(format)
    }

    /// Full file name this file should carry; the extension is lower-cased.
    pub fn intended_name(&self, resolver: &DateResolver, format: &str) -> anyhow::Result<String> {
        let prefix = self.intended_prefix(resolver, format)?;
        if self.ext.is_empty() {
            Ok(prefix)
        } else {
            Ok(format!("{}.{}", prefix, self.ext.to_lowercase()))
        }
    }

    /// Directory this file belongs in: `root/<dir_pattern applied to date>/album`.
    pub fn intended_path(
        &self,
        resolver: &DateResolver,
        root: &Path,
        dir_pattern: &str,
        album: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        let subdir = self.date(resolver).format(dir_pattern)?;
        let mut path = root.join(subdir);
        if let Some(album) = album.filter(|a| !a.is_empty()) {
            path.push(album);
        }
        Ok(path)
    }

    /// Whether the file name already follows the `2YYYYMMDD[_...].ext` layout.
    pub fn name_ok(&self) -> bool {
        let stem = Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        NAME_OK_RE.is_match(stem) && self.ext == self.ext.to_lowercase()
    }
}

/// SHA-256 hex digest of a file, read in bounded chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Byte-for-byte comparison of two files.
pub fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut ra = BufReader::with_capacity(CHUNK_SIZE, File::open(a)?);
    let mut rb = BufReader::with_capacity(CHUNK_SIZE, File::open(b)?);
    let mut ba = vec![0u8; CHUNK_SIZE];
    let mut bb = vec![0u8; CHUNK_SIZE];
    loop {
        let na = read_full(&mut ra, &mut ba)?;
        let nb = read_full(&mut rb, &mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Whether two paths name the same file on disk.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Move a file to `to`, which must not exist yet.
///
/// Fails with [`io::ErrorKind::AlreadyExists`] when `to` is taken, including
/// when another thread claims it at the same moment. Where a hard link is not
/// possible (e.g. across file systems) the file is copied into a freshly
/// created `to`, keeping its modification time.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::hard_link(from, to) {
        Ok(()) => return fs::remove_file(from),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(e),
        Err(_) => {}
    }

    let mut dest = OpenOptions::new().write(true).create_new(true).open(to)?;
    let copied = File::open(from)
        .and_then(|mut src| io::copy(&mut src, &mut dest))
        .and_then(|_| dest.sync_all());
    drop(dest);
    if let Err(e) = copied {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    let meta = fs::metadata(from)?;
    filetime::set_file_mtime(to, FileTime::from_last_modification_time(&meta))?;
    fs::set_permissions(to, meta.permissions())?;
    fs::remove_file(from)
}
