use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::confirm::Confirmer;
use crate::date::DateResolver;
use crate::manifest::Manifest;
use crate::media::{move_file, same_content, same_file, MediaFile};

/// How many numbered alternatives (`name_1` .. `name_9`) are tried after the
/// plain name is taken.
const MAX_SUFFIX: usize = 9;

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Name or location already right
    Unchanged,
    /// Renamed or moved to the given path
    Moved(PathBuf),
    /// An identical copy already sat at the given path; the source was removed
    RemovedDuplicate(PathBuf),
    /// Declined, or dry run
    Skipped,
    /// No date could be resolved
    NoDate,
    /// Every candidate name was taken by a different file
    NoFreeName,
}

/// Rename a file in place to its date-derived name.
///
/// Files whose name already starts with the intended prefix are left alone,
/// which keeps names like `20210615_143000-party.jpg`.
pub fn rename_file(
    media: &MediaFile,
    resolver: &DateResolver,
    format: &str,
    confirmer: &Confirmer,
    manifest: Option<&Manifest>,
) -> anyhow::Result<Outcome> {
    if media.date(resolver).is_sentinel() {
        warn!("{}: no date found, not renamed", media.path().display());
        return Ok(Outcome::NoDate);
    }
    let prefix = media.intended_prefix(resolver, format)?;
    if media.filename().starts_with(&prefix) {
        return Ok(Outcome::Unchanged);
    }
    let intended = media.intended_name(resolver, format)?;

    let mut confirmed = false;
    let mut i = 0;
    while i <= MAX_SUFFIX {
        let target = media.dirname().join(numbered(&intended, i));
        if target.is_file() {
            if same_file(media.path(), &target) {
                return Ok(Outcome::Unchanged);
            }
            if same_content(media.path(), &target)? {
                let msg = format!(
                    "rename {} to an existing file {}",
                    media.path().display(),
                    target.display()
                );
                return remove_source(media.path(), target, &msg, confirmer, manifest);
            }
            i += 1;
            continue;
        }

        if !confirmed {
            let msg = format!("rename {} to {}", media.path().display(), target.display());
            if !confirmer.decide(&msg)?.apply() {
                return Ok(Outcome::Skipped);
            }
            confirmed = true;
        }
        if !claim(media.path(), &target, &mut i)? {
            continue;
        }
        info!("{} renamed to {}", media.path().display(), target.display());
        if let Some(m) = manifest {
            m.rename(media.path(), &target)?;
        }
        return Ok(Outcome::Moved(target));
    }

    warn!("{}: no free name near {}", media.path().display(), intended);
    Ok(Outcome::NoFreeName)
}

/// Move a file into `root/<dir_pattern>/<album>`, keeping its name.
pub fn organize_file(
    media: &MediaFile,
    resolver: &DateResolver,
    root: &Path,
    dir_pattern: &str,
    album: Option<&str>,
    confirmer: &Confirmer,
    manifest: Option<&Manifest>,
) -> anyhow::Result<Outcome> {
    if media.date(resolver).is_sentinel() {
        warn!("{}: no date found, not moved", media.path().display());
        return Ok(Outcome::NoDate);
    }
    let dest_dir = media.intended_path(resolver, root, dir_pattern, album)?;
    if media.path().starts_with(&dest_dir) {
        return Ok(Outcome::Unchanged);
    }

    let msg = format!("move {} to {}", media.path().display(), dest_dir.display());
    if !confirmer.decide(&msg)?.apply() {
        return Ok(Outcome::Skipped);
    }
    fs::create_dir_all(&dest_dir)?;

    let mut i = 0;
    while i <= MAX_SUFFIX {
        let target = dest_dir.join(numbered(media.filename(), i));
        if target.is_file() {
            if same_content(media.path(), &target)? {
                fs::remove_file(media.path())?;
                info!("Remove duplicated file {}", media.path().display());
                if let Some(m) = manifest {
                    m.forget(media.path())?;
                }
                return Ok(Outcome::RemovedDuplicate(target));
            }
            i += 1;
            continue;
        }
        if !claim(media.path(), &target, &mut i)? {
            continue;
        }
        info!("{} moved to {}", media.path().display(), target.display());
        if let Some(m) = manifest {
            m.rename(media.path(), &target)?;
        }
        return Ok(Outcome::Moved(target));
    }

    warn!("{}: no free name in {}", media.path().display(), dest_dir.display());
    Ok(Outcome::NoFreeName)
}

/// Move `source` to `target` unless the name was taken since it was checked.
///
/// On a lost race the name is looked at again when it is now a regular file
/// (it may hold the same content), otherwise the next suffix is tried.
fn claim(source: &Path, target: &Path, suffix: &mut usize) -> io::Result<bool> {
    match move_file(source, target) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if !target.is_file() {
                *suffix += 1;
            }
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn remove_source(
    source: &Path,
    existing: PathBuf,
    msg: &str,
    confirmer: &Confirmer,
    manifest: Option<&Manifest>,
) -> anyhow::Result<Outcome> {
    if !confirmer.decide(msg)?.apply() {
        return Ok(Outcome::Skipped);
    }
    fs::remove_file(source)?;
    info!("{} removed, identical to {}", source.display(), existing.display());
    if let Some(m) = manifest {
        m.forget(source)?;
    }
    Ok(Outcome::RemovedDuplicate(existing))
}

/// `name` for `n == 0`, otherwise `stem_n.ext`.
fn numbered(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ConfirmPolicy;
    use crate::metadata::StaticBackend;

    fn yes() -> Confirmer {
        Confirmer::with_policy(ConfirmPolicy::PreConfirmed)
    }

    #[test]
    fn test_numbered() {
        assert_eq!(numbered("20210615_143000.jpg", 0), "20210615_143000.jpg");
        assert_eq!(numbered("20210615_143000.jpg", 3), "20210615_143000_3.jpg");
        assert_eq!(numbered("noext", 1), "noext_1");
    }

    #[test]
    fn test_rename_from_filename_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_20210615_143000.jpg");
        fs::write(&path, b"photo").unwrap();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);

        let media = MediaFile::new(&path).unwrap();
        let outcome = rename_file(&media, &resolver, "%Y%m%d_%H%M%S", &yes(), None).unwrap();
        let target = dir.path().join("20210615_143000.jpg");
        assert_eq!(outcome, Outcome::Moved(target.clone()));
        assert!(target.is_file());
        assert!(!path.exists());

        // a second pass finds nothing to do
        let media = MediaFile::new(&target).unwrap();
        assert_eq!(
            rename_file(&media, &resolver, "%Y%m%d_%H%M%S", &yes(), None).unwrap(),
            Outcome::Unchanged
        );
    }

    #[test]
    fn test_rename_collision_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("20210615_143000.jpg");
        fs::write(&taken, b"another photo").unwrap();
        let src = dir.path().join("IMG_20210615_143000.jpg");
        fs::write(&src, b"photo").unwrap();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);

        let outcome = rename_file(
            &MediaFile::new(&src).unwrap(),
            &resolver,
            "%Y%m%d_%H%M%S",
            &yes(),
            None,
        )
        .unwrap();
        let numbered = dir.path().join("20210615_143000_1.jpg");
        assert_eq!(outcome, Outcome::Moved(numbered.clone()));

        // identical content at the intended name: the source goes away
        let dup = dir.path().join("VID_20210615_143000.jpg");
        fs::write(&dup, b"another photo").unwrap();
        let outcome = rename_file(
            &MediaFile::new(&dup).unwrap(),
            &resolver,
            "%Y%m%d_%H%M%S",
            &yes(),
            None,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::RemovedDuplicate(taken));
        assert!(!dup.exists());
    }

    #[test]
    fn test_rename_dry_run_and_no_date() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("IMG_20210615_143000.jpg");
        fs::write(&src, b"photo").unwrap();
        let undated = dir.path().join("holiday.mp4");
        fs::write(&undated, b"clip").unwrap();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);
        let dry = Confirmer::with_policy(ConfirmPolicy::DryRun);

        let media = MediaFile::new(&src).unwrap();
        assert_eq!(
            rename_file(&media, &resolver, "%Y%m%d_%H%M%S", &dry, None).unwrap(),
            Outcome::Skipped
        );
        assert!(src.exists());

        let media = MediaFile::new(&undated).unwrap();
        assert_eq!(
            rename_file(&media, &resolver, "%Y%m%d_%H%M%S", &yes(), None).unwrap(),
            Outcome::NoDate
        );
    }

    #[test]
    fn test_rename_moves_manifest_record() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("IMG_20210615_143000.jpg");
        fs::write(&src, b"photo").unwrap();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);
        let manifest = Manifest::open_in_memory().unwrap();
        manifest.set_hash(&src, "abc").unwrap();

        rename_file(
            &MediaFile::new(&src).unwrap(),
            &resolver,
            "%Y%m%d_%H%M%S",
            &yes(),
            Some(&manifest),
        )
        .unwrap();
        let target = dir.path().join("20210615_143000.jpg");
        assert_eq!(manifest.get_hash(&target).unwrap().as_deref(), Some("abc"));
        assert!(manifest.get(&src).unwrap().is_none());
    }

    #[test]
    fn test_organize_into_dated_album() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let root = dir.path().join("library");
        fs::create_dir_all(&inbox).unwrap();
        let src = inbox.join("20210615_143000.jpg");
        fs::write(&src, b"photo").unwrap();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);

        let media = MediaFile::new(&src).unwrap();
        let outcome =
            organize_file(&media, &resolver, &root, "%Y/%b", Some("Trip"), &yes(), None).unwrap();
        let target = root.join("2021/Jun/Trip/20210615_143000.jpg");
        assert_eq!(outcome, Outcome::Moved(target.clone()));
        assert!(target.is_file());

        let media = MediaFile::new(&target).unwrap();
        assert_eq!(
            organize_file(&media, &resolver, &root, "%Y/%b", Some("Trip"), &yes(), None).unwrap(),
            Outcome::Unchanged
        );
    }

    #[test]
    fn test_organize_identical_destination_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("library");
        let existing = root.join("2021/Jun/20210615_143000.jpg");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, b"photo").unwrap();
        let src = dir.path().join("20210615_143000.jpg");
        fs::write(&src, b"photo").unwrap();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);

        let media = MediaFile::new(&src).unwrap();
        let outcome = organize_file(&media, &resolver, &root, "%Y/%b", None, &yes(), None).unwrap();
        assert_eq!(outcome, Outcome::RemovedDuplicate(existing));
        assert!(!src.exists());
    }

    #[test]
    fn test_parallel_renames_to_one_name_keep_every_file() {
        use crate::pool::{CancellationToken, WorkerPool};
        use std::collections::BTreeSet;

        let names = [
            "IMG_20210615_143000.jpg",
            "IMG_20210615_143000_1.jpg",
            "VID_20210615_143000.jpg",
            "PXL_20210615_143000123.jpg",
            "Screenshot_20210615-143000.jpg",
            "signal-2021-06-15-143000.jpg",
            "2021-06-15_14.30.00.jpg",
            "video-2021.06.15_14-30-00.jpg",
        ];
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);
        let confirmer = yes();

        for round in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let mut expected = BTreeSet::new();
            let sources: Vec<PathBuf> = names
                .iter()
                .enumerate()
                .map(|(n, name)| {
                    let path = dir.path().join(name);
                    let content = format!("round {} photo {}", round, n);
                    fs::write(&path, &content).unwrap();
                    expected.insert(content);
                    path
                })
                .collect();

            let mut moved = 0;
            WorkerPool::new(Some(8))
                .run_unordered(
                    sources.into_iter(),
                    &CancellationToken::new(),
                    |path| {
                        let media = MediaFile::new(&path).unwrap();
                        rename_file(&media, &resolver, "%Y%m%d_%H%M%S", &confirmer, None).unwrap()
                    },
                    |outcome| {
                        assert!(matches!(outcome, Outcome::Moved(_)), "{:?}", outcome);
                        moved += 1;
                        Ok(())
                    },
                )
                .unwrap();
            assert_eq!(moved, names.len());

            let left: BTreeSet<String> = fs::read_dir(dir.path())
                .unwrap()
                .map(|e| fs::read_to_string(e.unwrap().path()).unwrap())
                .collect();
            assert_eq!(left, expected);
            for n in 0..names.len() {
                assert!(dir.path().join(numbered("20210615_143000.jpg", n)).is_file());
            }
        }
    }

    #[test]
    fn test_parallel_organize_into_one_folder_keeps_every_file() {
        use crate::pool::{CancellationToken, WorkerPool};

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("library");
        let sources: Vec<PathBuf> = (0..6)
            .map(|n| {
                let path = dir.path().join(format!("card{}", n)).join("20210615_143000.jpg");
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, format!("photo {}", n)).unwrap();
                path
            })
            .collect();
        let backend = StaticBackend::new();
        let resolver = DateResolver::new(&backend);
        let confirmer = yes();

        WorkerPool::new(Some(6))
            .run_unordered(
                sources.into_iter(),
                &CancellationToken::new(),
                |path| {
                    let media = MediaFile::new(&path).unwrap();
                    organize_file(&media, &resolver, &root, "%Y", None, &confirmer, None).unwrap()
                },
                |_| Ok(()),
            )
            .unwrap();
        assert_eq!(fs::read_dir(root.join("2021")).unwrap().count(), 6);
    }
}
