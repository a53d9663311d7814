use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use walkdir::WalkDir;

use crate::confirm::Confirmer;
use crate::glob::Glob;

/// Camera and viewer leftovers removed when no pattern is configured.
pub const DEFAULT_REMOVABLE: &[&str] = &[
    "*.MOI",
    "*.PGI",
    "*.THM",
    "Default.PLS",
    ".picasa*.ini",
    "Thumbs.db",
    "*.ini",
    "*.bat",
    "autprint*",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Remove files whose name matches any of `patterns`, then directories left
/// empty, deepest first. The roots themselves are kept.
pub fn cleanup(
    roots: &[PathBuf],
    patterns: &[String],
    confirmer: &Confirmer,
) -> anyhow::Result<CleanupReport> {
    let globs = patterns
        .iter()
        .map(|p| Glob::new(p))
        .collect::<Result<Vec<_>, _>>()?;
    let mut report = CleanupReport::default();

    for root in roots {
        if !root.is_dir() {
            error!("{} is not a directory", root.display());
            continue;
        }
        // children before their parent, so emptied directories are seen empty
        for entry in WalkDir::new(root).contents_first(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            let path = entry.path();
            if entry.file_type().is_file() {
                let name = entry.file_name().to_string_lossy();
                if globs.iter().any(|g| g.is_match(&name))
                    && remove(path, confirmer, &format!("remove {}", path.display()))?
                {
                    report.files_removed += 1;
                }
            } else if entry.file_type().is_dir() && entry.depth() > 0 && is_empty_dir(path) {
                let msg = format!("remove empty directory {}", path.display());
                if remove(path, confirmer, &msg)? {
                    report.dirs_removed += 1;
                }
            }
        }
    }
    Ok(report)
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn remove(path: &Path, confirmer: &Confirmer, msg: &str) -> anyhow::Result<bool> {
    if !confirmer.decide(msg)?.apply() {
        return Ok(false);
    }
    let result = if path.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            info!("Removed {}", path.display());
            Ok(true)
        }
        Err(e) => {
            warn!("cannot remove {}: {}", path.display(), e);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ConfirmPolicy;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn defaults() -> Vec<String> {
        DEFAULT_REMOVABLE.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_removes_junk_and_emptied_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        touch(&root.join("keep/a.jpg"));
        touch(&root.join("keep/Thumbs.db"));
        touch(&root.join("junk/deeper/MOV001.THM"));
        touch(&root.join("junk/.picasa.ini"));
        fs::create_dir_all(root.join("empty/nested")).unwrap();

        let yes = Confirmer::with_policy(ConfirmPolicy::PreConfirmed);
        let report = cleanup(&[root.clone()], &defaults(), &yes).unwrap();

        assert_eq!(report.files_removed, 3);
        // junk/deeper, junk, empty/nested, empty
        assert_eq!(report.dirs_removed, 4);
        assert!(root.join("keep/a.jpg").exists());
        assert!(!root.join("keep/Thumbs.db").exists());
        assert!(!root.join("junk").exists());
        assert!(!root.join("empty").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        touch(&root.join("a/Thumbs.db"));
        fs::create_dir_all(root.join("b")).unwrap();

        let dry = Confirmer::with_policy(ConfirmPolicy::DryRun);
        let report = cleanup(&[root.clone()], &defaults(), &dry).unwrap();
        assert_eq!(report, CleanupReport::default());
        assert!(root.join("a/Thumbs.db").exists());
        assert!(root.join("b").exists());
    }

    #[test]
    fn test_custom_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        touch(&root.join("a.xmp"));
        touch(&root.join("a.jpg"));
        let yes = Confirmer::with_policy(ConfirmPolicy::PreConfirmed);
        let report = cleanup(&[root.clone()], &["*.xmp".to_string()], &yes).unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(root.join("a.jpg").exists());
    }
}
