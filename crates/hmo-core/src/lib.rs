pub mod classify;
pub mod cleanup;
pub mod config;
pub mod confirm;
pub mod date;
pub mod dedup;
pub mod exif_edit;
pub mod glob;
pub mod hash_cache;
pub mod manifest;
pub mod media;
pub mod metadata;
pub mod organize;
pub mod pool;
pub mod select;
pub mod tags;
pub mod validate;

use std::time::{Duration, Instant};

pub use config::Config;
pub use confirm::{ConfirmPolicy, Confirmer, Decision};
pub use date::{DateLabel, DateResolver, Strategy};
pub use manifest::{Manifest, ManifestEntry, TagMap};
pub use media::MediaFile;
pub use metadata::{ExifTool, Metadata, MetadataBackend, StaticBackend};
pub use pool::{CancellationToken, CancelledError, WorkerPool};
pub use select::{Predicate, SelectError, Selection};

/// Type alias for progress callback: (stage, current, total, message).
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Throttled progress reporter; emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: std::sync::Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        Self {
            inner,
            last_emit: std::sync::Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

fn discard(_: &str, _: u64, _: u64, _: &str) {}

/// A progress callback that discards every report.
pub fn silent_progress() -> &'static ProgressCallback {
    &discard
}
