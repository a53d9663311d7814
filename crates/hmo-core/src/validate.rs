use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use log::{info, warn};
use serde::Deserialize;

use crate::confirm::Confirmer;
use crate::manifest::Manifest;
use crate::media::hash_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Good,
    /// Content changed since its hash was recorded
    Corrupted,
    /// Cannot be decoded or has no video stream
    Unplayable,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub path: PathBuf,
    pub hash: String,
    pub verdict: Verdict,
}

/// Asks `ffprobe` whether a container carries a video stream.
#[derive(Debug)]
pub struct FfProbe {
    program: PathBuf,
    available: OnceLock<bool>,
}

impl Default for FfProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: String,
}

impl FfProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            available: OnceLock::new(),
        }
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let ok = Command::new(&self.program)
                .arg("-version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !ok {
                warn!("{} not installed, skip video checks", self.program.display());
            }
            ok
        })
    }

    /// `None` when the tool is not installed.
    pub fn has_video_stream(&self, path: &Path) -> Option<bool> {
        if !self.is_available() {
            return None;
        }
        let output = Command::new(&self.program)
            .args(["-v", "error", "-show_streams", "-of", "json"])
            .arg(path)
            .output()
            .ok()?;
        if !output.status.success() {
            return Some(false);
        }
        let probe: ProbeOutput = match serde_json::from_slice(&output.stdout) {
            Ok(p) => p,
            Err(_) => return Some(false),
        };
        Some(probe.streams.iter().any(|s| s.codec_type == "video"))
    }
}

/// Decode the whole image; any failure means the file is broken.
pub fn jpeg_openable(path: &Path) -> bool {
    image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(image::ImageError::IoError)
        .and_then(|r| r.decode())
        .is_ok()
}

#[derive(Debug, Default)]
pub struct Validator {
    ffprobe: FfProbe,
}

impl Validator {
    pub fn new(ffprobe: FfProbe) -> Self {
        Self { ffprobe }
    }

    /// Hash the file and judge it. Read-only.
    pub fn check(&self, path: &Path, manifest: Option<&Manifest>) -> anyhow::Result<Check> {
        let hash = hash_file(path)?;
        let recorded = match manifest {
            Some(m) => m.get_hash(path)?,
            None => None,
        };
        let verdict = if recorded.is_some_and(|h| h != hash) {
            Verdict::Corrupted
        } else if !self.playable(path) {
            Verdict::Unplayable
        } else {
            Verdict::Good
        };
        Ok(Check {
            path: path.to_path_buf(),
            hash,
            verdict,
        })
    }

    fn playable(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => jpeg_openable(path),
            "mp4" | "mpg" => self.ffprobe.has_video_stream(path).unwrap_or(true),
            _ => true,
        }
    }
}

/// Act on a check: report bad files and optionally remove them, record the
/// hash of good ones.
pub fn apply_check(
    check: &Check,
    remove: bool,
    confirmer: &Confirmer,
    manifest: Option<&Manifest>,
) -> anyhow::Result<()> {
    match check.verdict {
        Verdict::Good => {
            if let Some(m) = manifest {
                m.set_hash(&check.path, &check.hash)?;
            }
            return Ok(());
        }
        Verdict::Corrupted => warn!("{} is corrupted.", check.path.display()),
        Verdict::Unplayable => warn!("{} is not playable.", check.path.display()),
    }
    if !remove {
        return Ok(());
    }
    if confirmer
        .decide(&format!("remove {}", check.path.display()))?
        .apply()
    {
        match fs::remove_file(&check.path) {
            Ok(()) => {
                info!("{} is removed.", check.path.display());
                if let Some(m) = manifest {
                    m.forget(&check.path)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ConfirmPolicy;

    fn validator() -> Validator {
        Validator::new(FfProbe::new("/nonexistent/ffprobe"))
    }

    #[test]
    fn test_jpeg_checks() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.jpg");
        image::RgbImage::new(8, 8).save(&good).unwrap();
        let bad = dir.path().join("bad.jpg");
        fs::write(&bad, b"\xff\xd8\xff\xe0 truncated").unwrap();

        let v = validator();
        assert_eq!(v.check(&good, None).unwrap().verdict, Verdict::Good);
        assert_eq!(v.check(&bad, None).unwrap().verdict, Verdict::Unplayable);
    }

    #[test]
    fn test_video_check_skipped_without_ffprobe() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        fs::write(&clip, b"not really a video").unwrap();
        assert_eq!(validator().check(&clip, None).unwrap().verdict, Verdict::Good);
    }

    #[test]
    fn test_hash_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mov");
        fs::write(&clip, b"original").unwrap();
        let manifest = Manifest::open_in_memory().unwrap();
        let yes = Confirmer::with_policy(ConfirmPolicy::PreConfirmed);

        // first run records the hash
        let check = validator().check(&clip, Some(&manifest)).unwrap();
        assert_eq!(check.verdict, Verdict::Good);
        apply_check(&check, false, &yes, Some(&manifest)).unwrap();
        assert_eq!(
            manifest.get_hash(&clip).unwrap(),
            Some(hash_file(&clip).unwrap())
        );

        fs::write(&clip, b"bit rot").unwrap();
        let check = validator().check(&clip, Some(&manifest)).unwrap();
        assert_eq!(check.verdict, Verdict::Corrupted);

        // without --remove the file stays
        apply_check(&check, false, &yes, Some(&manifest)).unwrap();
        assert!(clip.exists());
        apply_check(&check, true, &yes, Some(&manifest)).unwrap();
        assert!(!clip.exists());
        assert!(manifest.get(&clip).unwrap().is_none());
    }

    #[test]
    fn test_dry_run_does_not_remove() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.jpg");
        fs::write(&bad, b"garbage").unwrap();
        let check = validator().check(&bad, None).unwrap();
        let dry = Confirmer::with_policy(ConfirmPolicy::DryRun);
        apply_check(&check, true, &dry, None).unwrap();
        assert!(bad.exists());
    }
}
