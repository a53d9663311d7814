use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use hmo_core::classify::{
    classify_file, Classifier, ClassifierSpec, CommandDetector, DetectionCache,
};
use hmo_core::cleanup::{cleanup, DEFAULT_REMOVABLE};
use hmo_core::confirm::TerminalPrompt;
use hmo_core::dedup::{find_duplicates, remove_duplicates};
use hmo_core::exif_edit::{parse_assignments, set_exif, shift_exif, Shift};
use hmo_core::hash_cache::HashCache;
use hmo_core::metadata::select_keys;
use hmo_core::organize::{organize_file, rename_file, Outcome};
use hmo_core::select::Files;
use hmo_core::tags::{build_tags, render_metadata, render_tags};
use hmo_core::validate::{apply_check, Validator};
use hmo_core::{
    CancellationToken, Config, ConfirmPolicy, Confirmer, DateResolver, ExifTool, Manifest,
    MediaFile, MetadataBackend, Selection, ThrottledProgress, WorkerPool,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use crate::{Command, Common};

pub struct Context {
    pub config: Config,
    pub cancel: CancellationToken,
}

/// Per-outcome counts of a rename or organize run.
#[derive(Debug, Default)]
struct Tally {
    changed: usize,
    unchanged: usize,
    duplicates: usize,
    skipped: usize,
    failed: usize,
}

impl Tally {
    fn add(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Moved(_) => self.changed += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::RemovedDuplicate(_) => self.duplicates += 1,
            Outcome::Skipped | Outcome::NoDate | Outcome::NoFreeName => self.skipped += 1,
        }
    }
}

pub fn run(ctx: &Context, command: Command) -> anyhow::Result<()> {
    let backend = ExifTool::default();
    match command {
        Command::List { common } => list(ctx, &common, &backend),
        Command::ShowExif {
            common,
            keys,
            format,
        } => {
            let selection = selection(&common)?;
            let mut files = selection.files(&common.items, &backend);
            let mut shown = 0;
            for path in files.by_ref() {
                ctx.cancel.check()?;
                match backend.read(&path) {
                    Ok(metadata) => {
                        let selected = select_keys(&metadata, &keys)?;
                        println!("{}", render_metadata(&selected, format)?);
                        shown += 1;
                    }
                    Err(e) => warn!("{}: {:#}", path.display(), e),
                }
            }
            report_bad_roots(&files);
            info!("{} files shown.", shown);
            Ok(())
        }
        Command::Rename { common, format } => {
            let format = format.unwrap_or_else(|| ctx.config.rename_format().to_string());
            let manifest = open_manifest(ctx, &common, false)?;
            let resolver = DateResolver::new(&backend);
            let confirmer = confirmer(common.yes, common.no);
            let mut tally = Tally::default();
            let failed = each_file(ctx, &common, &backend, &confirmer, "renaming", |path| {
                let media = MediaFile::new(path)?;
                rename_file(&media, &resolver, &format, &confirmer, manifest.as_ref())
            }, |_, outcome| {
                tally.add(&outcome);
                Ok(())
            })?;
            tally.failed = failed;
            info!(
                "{} renamed, {} already named, {} duplicates removed, {} skipped, {} failed.",
                tally.changed, tally.unchanged, tally.duplicates, tally.skipped, tally.failed
            );
            Ok(())
        }
        Command::Organize {
            common,
            media_root,
            dir_pattern,
            album,
        } => {
            let Some(root) = media_root.or_else(|| ctx.config.organize.media_root.clone()) else {
                bail!("no media root specified; use --media-root or set [organize] media_root");
            };
            let root = std::path::absolute(&root)?;
            let dir_pattern = dir_pattern.unwrap_or_else(|| ctx.config.dir_pattern().to_string());
            let manifest = open_manifest(ctx, &common, false)?;
            let resolver = DateResolver::new(&backend);
            let confirmer = confirmer(common.yes, common.no);
            let mut tally = Tally::default();
            let failed = each_file(ctx, &common, &backend, &confirmer, "organizing", |path| {
                let media = MediaFile::new(path)?;
                organize_file(
                    &media,
                    &resolver,
                    &root,
                    &dir_pattern,
                    album.as_deref(),
                    &confirmer,
                    manifest.as_ref(),
                )
            }, |_, outcome| {
                tally.add(&outcome);
                Ok(())
            })?;
            tally.failed = failed;
            info!(
                "{} moved, {} in place, {} duplicates removed, {} skipped, {} failed.",
                tally.changed, tally.unchanged, tally.duplicates, tally.skipped, tally.failed
            );
            Ok(())
        }
        Command::Dedup {
            common,
            no_cache,
            cache,
        } => dedup(ctx, &common, &backend, no_cache, cache),
        Command::Validate { common, remove } => {
            let manifest = open_manifest(ctx, &common, false)?;
            let validator = Validator::default();
            let confirmer = confirmer(common.yes, common.no);
            let failed = each_file(ctx, &common, &backend, &confirmer, "validating", |path| {
                validator.check(path, manifest.as_ref())
            }, |_, check| apply_check(&check, remove, &confirmer, manifest.as_ref()))?;
            if failed > 0 {
                warn!("{} files could not be read.", failed);
            }
            Ok(())
        }
        Command::ShiftExif {
            common,
            shift,
            keys,
        } => {
            let shift = Shift {
                years: shift.years,
                months: shift.months,
                weeks: shift.weeks,
                days: shift.days,
                hours: shift.hours,
                minutes: shift.minutes,
                seconds: shift.seconds,
            };
            if shift.is_zero() {
                bail!("nothing to shift; give at least one of --years .. --seconds");
            }
            let now = chrono::Local::now().naive_local();
            let confirmer = confirmer(common.yes, common.no);
            let mut changed = 0;
            each_file(ctx, &common, &backend, &confirmer, "shifting", |path| {
                shift_exif(path, &backend, &shift, &keys, now, &confirmer)
            }, |_, written| {
                if !written.is_empty() {
                    changed += 1;
                }
                Ok(())
            })?;
            info!("{} files updated.", changed);
            Ok(())
        }
        Command::SetExif {
            common,
            values,
            overwrite,
        } => {
            let values = parse_assignments(&values)?;
            let confirmer = confirmer(common.yes, common.no);
            let mut changed = 0;
            each_file(ctx, &common, &backend, &confirmer, "updating", |path| {
                set_exif(path, &backend, &values, overwrite, &confirmer)
            }, |_, written| {
                if !written.is_empty() {
                    changed += 1;
                }
                Ok(())
            })?;
            info!("{} files updated.", changed);
            Ok(())
        }
        Command::Cleanup {
            items,
            patterns,
            yes,
            no,
        } => {
            let patterns = if !patterns.is_empty() {
                patterns
            } else if let Some(p) = &ctx.config.cleanup.patterns {
                p.clone()
            } else {
                DEFAULT_REMOVABLE.iter().map(|s| s.to_string()).collect()
            };
            let report = cleanup(&items, &patterns, &confirmer(yes, no))?;
            info!(
                "{} files and {} empty directories removed.",
                report.files_removed, report.dirs_removed
            );
            Ok(())
        }
        Command::Classify {
            common,
            models,
            tags,
            threshold,
            overwrite,
            no_cache,
        } => {
            let manifest = open_manifest(ctx, &common, true)?
                .context("manifest required")?;
            let detector = CommandDetector::new(ctx.config.classifier_commands());
            let classifiers = models
                .iter()
                .map(|m| -> anyhow::Result<Classifier> {
                    let spec: ClassifierSpec = m.parse()?;
                    if !detector.has_command(spec.model) {
                        bail!(
                            "no command configured for {0}; add [classifiers.{0}] command = [...] to the config file",
                            spec.model.name()
                        );
                    }
                    Ok(Classifier::new(spec, threshold, tags.clone())?)
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let cache = DetectionCache {
                manifest: &manifest,
                refresh: no_cache,
            };
            let confirmer = confirmer(common.yes, common.no);
            let (mut tagged, mut processed) = (0, 0);
            each_file(ctx, &common, &backend, &confirmer, "classifying", |path| {
                Ok(classify_file(&classifiers, &detector, path, Some(&cache)))
            }, |path, found| {
                processed += 1;
                if found.is_empty() {
                    return Ok(());
                }
                let names: Vec<&str> = found.keys().map(String::as_str).collect();
                let msg = format!("tag {} with {}", path.display(), names.join(", "));
                if confirmer.decide(&msg)?.apply() {
                    if overwrite {
                        manifest.set_tags(path, &found)?;
                    } else {
                        manifest.add_tags(path, &found)?;
                    }
                    tagged += 1;
                }
                Ok(())
            })?;
            info!("{} of {} files are tagged.", tagged, processed);
            Ok(())
        }
        Command::SetTags {
            common,
            tags,
            metadata,
            overwrite,
        } => {
            let manifest = open_manifest(ctx, &common, true)?
                .context("manifest required")?;
            let tags = build_tags(&tags, &parse_assignments(&metadata)?);
            let confirmer = batch_confirmer(common.no);
            let mut count = 0;
            each_file(ctx, &common, &backend, &confirmer, "tagging", |path| {
                let msg = format!("tag {}", path.display());
                if !confirmer.decide(&msg)?.apply() {
                    return Ok(false);
                }
                if overwrite {
                    manifest.set_tags(path, &tags)?;
                } else {
                    manifest.add_tags(path, &tags)?;
                }
                Ok(true)
            }, |_, done| {
                count += usize::from(done);
                Ok(())
            })?;
            info!("{} files tagged.", count);
            Ok(())
        }
        Command::RemoveTags { common, tags } => {
            let manifest = open_manifest(ctx, &common, true)?
                .context("manifest required")?;
            let tagged: HashSet<PathBuf> = manifest
                .find_by_tags(&tags)?
                .into_iter()
                .map(|e| e.path)
                .collect();
            let confirmer = batch_confirmer(common.no);
            let mut count = 0;
            each_file(ctx, &common, &backend, &confirmer, "untagging", |path| {
                if !tagged.contains(&std::path::absolute(path)?) {
                    return Ok(false);
                }
                let msg = format!("remove tags {} from {}", tags.join(", "), path.display());
                if !confirmer.decide(&msg)?.apply() {
                    return Ok(false);
                }
                manifest.remove_tags(path, &tags)?;
                Ok(true)
            }, |_, done| {
                count += usize::from(done);
                Ok(())
            })?;
            info!("{} files untagged.", count);
            Ok(())
        }
        Command::ShowTags {
            common,
            tags,
            format,
        } => {
            let manifest = open_manifest(ctx, &common, true)?
                .context("manifest required")?;
            let roots = common
                .items
                .iter()
                .map(std::path::absolute)
                .collect::<std::io::Result<Vec<_>>>()?;
            let entries: Vec<_> = manifest
                .find_by_tags(&tags)?
                .into_iter()
                .filter(|e| roots.iter().any(|r| e.path.starts_with(r)))
                .collect();
            println!("{}", render_tags(&entries, format)?.trim_end());
            info!("{} files shown.", entries.len());
            Ok(())
        }
    }
}

fn list(ctx: &Context, common: &Common, backend: &dyn MetadataBackend) -> anyhow::Result<()> {
    let selection = selection(common)?;
    let mut files = selection.files(&common.items, backend);
    for path in files.by_ref() {
        ctx.cancel.check()?;
        println!("{}", path.display());
    }
    report_bad_roots(&files);
    Ok(())
}

fn dedup(
    ctx: &Context,
    common: &Common,
    backend: &dyn MetadataBackend,
    no_cache: bool,
    cache_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let selection = selection(common)?;
    let mut iter = selection.files(&common.items, backend);
    let mut files = Vec::new();
    for path in iter.by_ref() {
        ctx.cancel.check()?;
        files.push(path);
    }
    report_bad_roots(&iter);

    let cache_path = cache_path.or_else(|| ctx.config.dedup.cache.clone());
    let mut cache = match &cache_path {
        Some(p) => Some(HashCache::load(p)?),
        None => None,
    };
    if no_cache {
        if let Some(c) = cache.as_mut() {
            c.clear();
        }
    }

    let bar = progress_bar(false, "Checking file content");
    let report_bar = bar.clone();
    let callback = move |_: &str, current: u64, total: u64, message: &str| {
        report_bar.set_length(total);
        report_bar.set_position(current + 1);
        report_bar.set_message(message.to_string());
    };
    let progress = ThrottledProgress::new(&callback);
    let plan = find_duplicates(
        &files,
        cache.as_mut(),
        common.jobs.or(ctx.config.jobs),
        &progress,
    )?;
    bar.finish_and_clear();
    ctx.cancel.check()?;

    if let (Some(c), Some(p)) = (&cache, &cache_path) {
        c.save(p)?;
    }

    let manifest = open_manifest(ctx, common, false)?;
    remove_duplicates(&plan, &confirmer(common.yes, common.no), manifest.as_ref())?;
    Ok(())
}

/// Run `work` on every selected file, in parallel unless each action needs a
/// prompt. `sink` sees results on this thread in completion order. Returns the
/// number of files whose `work` failed.
fn each_file<T, W, S>(
    ctx: &Context,
    common: &Common,
    backend: &dyn MetadataBackend,
    confirmer: &Confirmer,
    what: &str,
    work: W,
    mut sink: S,
) -> anyhow::Result<usize>
where
    T: Send,
    W: Fn(&Path) -> anyhow::Result<T> + Sync,
    S: FnMut(&Path, T) -> anyhow::Result<()>,
{
    let selection = selection(common)?;
    let mut files = selection.files(&common.items, backend);
    let interactive = confirmer.policy() == ConfirmPolicy::AlwaysAsk;
    let pool = if interactive {
        WorkerPool::new(Some(1))
    } else {
        WorkerPool::new(common.jobs.or(ctx.config.jobs))
    };
    let bar = progress_bar(interactive, what);

    let mut failed = 0;
    let result = pool.run_unordered(
        &mut files,
        &ctx.cancel,
        |path| {
            let result = work(&path);
            (path, result)
        },
        |(path, result)| {
            bar.inc(1);
            match result {
                Ok(value) => sink(&path, value),
                Err(e) => {
                    error!("{}: {:#}", path.display(), e);
                    failed += 1;
                    Ok(())
                }
            }
        },
    );
    bar.finish_and_clear();
    report_bad_roots(&files);
    result?;
    Ok(failed)
}

fn selection(common: &Common) -> anyhow::Result<Selection> {
    Ok(Selection::new(
        &common.file_types,
        &common.with_exif,
        &common.without_exif,
    )?)
}

fn report_bad_roots(files: &Files<'_>) {
    if files.bad_roots() > 0 {
        warn!("{} arguments skipped.", files.bad_roots());
    }
}

fn confirmer(yes: bool, no: bool) -> Confirmer {
    Confirmer::new(ConfirmPolicy::from_flags(yes, no), Box::new(TerminalPrompt))
}

/// Bookkeeping commands act without asking but still honor `--no`.
fn batch_confirmer(no: bool) -> Confirmer {
    Confirmer::with_policy(ConfirmPolicy::from_flags(true, no))
}

fn open_manifest(
    ctx: &Context,
    common: &Common,
    required: bool,
) -> anyhow::Result<Option<Manifest>> {
    match common.manifest.as_ref().or(ctx.config.manifest.as_ref()) {
        Some(path) => Ok(Some(Manifest::open(path)?)),
        None if required => {
            bail!("no manifest file specified; use --manifest or set `manifest` in the config file")
        }
        None => Ok(None),
    }
}

fn progress_bar(hidden: bool, what: &str) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {pos} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(what.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}
