use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use rayon::prelude::*;

use crate::confirm::Confirmer;
use crate::hash_cache::HashCache;
use crate::manifest::Manifest;
use crate::media::hash_file;
use crate::ThrottledProgress;

/// Files sharing one content digest.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub hash: String,
    /// The copy that is kept
    pub survivor: PathBuf,
    /// Copies to remove, in selection order
    pub duplicates: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct DedupPlan {
    /// Ordered by digest
    pub groups: Vec<DuplicateGroup>,
    /// Files that could not be examined, with the reason
    pub failures: Vec<(PathBuf, String)>,
}

impl DedupPlan {
    pub fn duplicate_count(&self) -> usize {
        self.groups.iter().map(|g| g.duplicates.len()).sum()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupReport {
    pub duplicates: usize,
    pub removed: usize,
}

/// Find byte-identical files among `files`.
///
/// Only files sharing a size with another file are hashed. Digests found in
/// `cache` are reused and fresh ones are added to it. In each group the path
/// with the most characters survives; on a tie the one listed last wins.
pub fn find_duplicates(
    files: &[PathBuf],
    mut cache: Option<&mut HashCache>,
    jobs: Option<usize>,
    progress: &ThrottledProgress,
) -> anyhow::Result<DedupPlan> {
    let mut plan = DedupPlan::default();

    // Group by size
    let mut size_groups: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, path) in files.iter().enumerate() {
        match fs::metadata(path) {
            Ok(meta) => size_groups.entry(meta.len()).or_default().push(i),
            Err(e) => {
                warn!("{}: {}", path.display(), e);
                plan.failures.push((path.clone(), e.to_string()));
            }
        }
    }

    let mut needs_hash: Vec<usize> = size_groups
        .into_values()
        .filter(|indices| indices.len() > 1)
        .flatten()
        .collect();
    needs_hash.sort_unstable();

    let mut hashes: HashMap<usize, String> = HashMap::new();
    let mut to_compute = Vec::new();
    for &i in &needs_hash {
        let cached = cache
            .as_deref()
            .and_then(|c| c.get(&cache_key(&files[i])).map(str::to_string));
        match cached {
            Some(h) => {
                hashes.insert(i, h);
            }
            None => to_compute.push(i),
        }
    }

    let total = to_compute.len() as u64;
    let counter = AtomicU64::new(0);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.unwrap_or(0))
        .build()?;
    let computed: Vec<(usize, std::io::Result<String>)> = pool.install(|| {
        to_compute
            .par_iter()
            .map(|&i| {
                let result = hash_file(&files[i]);
                let current = counter.fetch_add(1, Ordering::Relaxed);
                progress.report("dedup", current, total, "Checking file content");
                (i, result)
            })
            .collect()
    });

    for (i, result) in computed {
        match result {
            Ok(h) => {
                if let Some(c) = cache.as_deref_mut() {
                    c.insert(cache_key(&files[i]), h.clone());
                }
                hashes.insert(i, h);
            }
            Err(e) => {
                warn!("{}: cannot hash: {}", files[i].display(), e);
                plan.failures.push((files[i].clone(), e.to_string()));
            }
        }
    }

    // Group by hash, members in selection order
    let mut hash_groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for &i in &needs_hash {
        if let Some(h) = hashes.remove(&i) {
            hash_groups.entry(h).or_default().push(i);
        }
    }

    for (hash, members) in hash_groups {
        if members.len() < 2 {
            continue;
        }
        let Some(&keep) = members
            .iter()
            .max_by_key(|&&i| files[i].to_string_lossy().chars().count())
        else {
            continue;
        };
        plan.groups.push(DuplicateGroup {
            hash,
            survivor: files[keep].clone(),
            duplicates: members
                .iter()
                .filter(|&&i| i != keep)
                .map(|&i| files[i].clone())
                .collect(),
        });
    }

    Ok(plan)
}

/// Remove every non-survivor copy the confirmer approves.
pub fn remove_duplicates(
    plan: &DedupPlan,
    confirmer: &Confirmer,
    manifest: Option<&Manifest>,
) -> anyhow::Result<DedupReport> {
    let mut report = DedupReport {
        duplicates: plan.duplicate_count(),
        removed: 0,
    };
    for group in &plan.groups {
        for dup in &group.duplicates {
            info!(
                "{} is a duplicated copy of {}",
                dup.display(),
                group.survivor.display()
            );
            if !confirmer.decide(&format!("remove {}", dup.display()))?.apply() {
                continue;
            }
            match fs::remove_file(dup) {
                Ok(()) => {
                    info!("{} is removed.", dup.display());
                    report.removed += 1;
                    if let Some(Err(e)) = manifest.map(|m| m.forget(dup)) {
                        warn!("{}: removed but still in the manifest: {:#}", dup.display(), e);
                    }
                }
                Err(e) => warn!("cannot remove {}: {}", dup.display(), e),
            }
        }
    }
    info!(
        "{} out of {} duplicated files are removed.",
        report.removed, report.duplicates
    );
    Ok(report)
}

fn cache_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
