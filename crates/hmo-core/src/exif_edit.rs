use std::path::Path;
use std::sync::LazyLock;

use anyhow::{anyhow, Context};
use chrono::{Duration, Months, NaiveDateTime};
use filetime::FileTime;
use log::{debug, info, warn};
use regex::Regex;

use crate::confirm::Confirmer;
use crate::metadata::{Metadata, MetadataBackend};

const EXIF_DATETIME: &str = "%Y:%m:%d %H:%M:%S";
const FILE_MODIFY_DATE: &str = "File:FileModifyDate";

// datetime part, then whatever follows (sub-seconds, time zone offset)
static EXIF_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}:\d{2}:\d{2} \d{2}:\d{2}:\d{2})(.*)$").unwrap()
});

/// Calendar shift applied to date values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shift {
    pub years: i32,
    pub months: i32,
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl Shift {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Years and months move the calendar position (day clamped to the end of
    /// a shorter month); the rest is a plain duration.
    pub fn apply(&self, dt: NaiveDateTime) -> Option<NaiveDateTime> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let shifted = if months >= 0 {
            dt.checked_add_months(Months::new(months.unsigned_abs()))?
        } else {
            dt.checked_sub_months(Months::new(months.unsigned_abs()))?
        };
        let delta = Duration::try_weeks(self.weeks)?
            .checked_add(&Duration::try_days(self.days)?)?
            .checked_add(&Duration::try_hours(self.hours)?)?
            .checked_add(&Duration::try_minutes(self.minutes)?)?
            .checked_add(&Duration::try_seconds(self.seconds)?)?;
        shifted.checked_add_signed(delta)
    }
}

/// Split `2021:06:15 14:30:00+02:00` into the datetime and the kept suffix.
pub fn parse_exif_datetime(value: &str) -> Option<(NaiveDateTime, &str)> {
    let caps = EXIF_VALUE_RE.captures(value.trim())?;
    let dt = NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), EXIF_DATETIME).ok()?;
    Some((dt, caps.get(2).map_or("", |m| m.as_str())))
}

/// Set the file's modification time, reading `dt` as local time.
pub fn set_mtime(path: &Path, dt: &NaiveDateTime) -> anyhow::Result<()> {
    let local = dt
        .and_local_timezone(chrono::Local)
        .earliest()
        .ok_or_else(|| anyhow!("{} does not exist in the local time zone", dt))?;
    filetime::set_file_mtime(path, FileTime::from_unix_time(local.timestamp(), 0))
        .with_context(|| format!("cannot set modification time of {}", path.display()))
}

/// Shift every `*Date` value of a file (or only `keys`, if given).
///
/// Results at or after `now` are dropped. `File:FileModifyDate` is applied
/// to the file's mtime; other `File:` keys cannot be written and are ignored.
/// Returns the embedded values that were written.
pub fn shift_exif(
    path: &Path,
    backend: &dyn MetadataBackend,
    shift: &Shift,
    keys: &[String],
    now: NaiveDateTime,
    confirmer: &Confirmer,
) -> anyhow::Result<Metadata> {
    let metadata = backend.read(path)?;
    let name = display_name(path);
    let mut changes = Metadata::new();

    for (key, value) in &metadata {
        if !key.ends_with("Date") || (!keys.is_empty() && !keys.contains(key)) {
            continue;
        }
        let Some((dt, suffix)) = parse_exif_datetime(value) else {
            debug!("{}: {} = {:?} is not a date", name, key, value);
            continue;
        };
        let Some(shifted) = shift.apply(dt) else {
            warn!("{}: cannot shift {} from {}", name, key, value);
            continue;
        };
        if shifted >= now {
            warn!("Ignore future date {} for {} of {}", shifted, key, name);
        } else if key == FILE_MODIFY_DATE {
            let msg = format!("modify file modified date {} to {}", name, shifted);
            if confirmer.decide(&msg)?.apply() {
                set_mtime(path, &shifted)?;
            }
        } else if key.starts_with("File:") {
            info!("Ignore non-EXIF meta information {}", key);
        } else {
            changes.insert(key.clone(), format!("{}{}", shifted.format(EXIF_DATETIME), suffix));
        }
    }

    if changes.is_empty() {
        return Ok(changes);
    }
    for (key, new_value) in &changes {
        info!("Shift {} from {} to {}", key, metadata[key], new_value);
    }
    let msg = format!("shift dates of {} as shown above", name);
    if !confirmer.decide(&msg)?.apply() {
        return Ok(Metadata::new());
    }
    backend.write(path, &changes)?;
    Ok(changes)
}

/// Set `values` on a file. Keys already present are left alone unless
/// `overwrite` is set.
///
/// Returns the embedded values that were written.
pub fn set_exif(
    path: &Path,
    backend: &dyn MetadataBackend,
    values: &Metadata,
    overwrite: bool,
    confirmer: &Confirmer,
) -> anyhow::Result<Metadata> {
    let metadata = backend.read(path)?;
    let name = display_name(path);
    let mut changes = Metadata::new();

    for (key, value) in values {
        if !overwrite && !key.starts_with("File:") {
            if let Some(existing) = metadata.get(key) {
                info!("Ignore existing {} = {}", key, existing);
                continue;
            }
        }
        if key == FILE_MODIFY_DATE {
            let Ok(dt) = NaiveDateTime::parse_from_str(value, EXIF_DATETIME) else {
                warn!("Invalid date format {}", value);
                continue;
            };
            let msg = format!("modify file modified date {} to {}", name, value);
            if confirmer.decide(&msg)?.apply() {
                set_mtime(path, &dt)?;
                info!("Modified date of {} is set to {}", name, value);
            }
        } else if key.starts_with("File:") {
            info!("Ignore non-EXIF meta information {}", key);
        } else {
            info!("Set {} of {} to {}", key, name, value);
            changes.insert(key.clone(), value.clone());
        }
    }

    if changes.is_empty() {
        return Ok(changes);
    }
    if !confirmer
        .decide(&format!("set exif of {}", path.display()))?
        .apply()
    {
        return Ok(Metadata::new());
    }
    backend.write(path, &changes)?;
    info!("EXIF data of {} is updated.", name);
    Ok(changes)
}

/// Parse `KEY=VALUE` arguments.
pub fn parse_assignments(items: &[String]) -> anyhow::Result<Metadata> {
    items
        .iter()
        .map(|item| {
            item.split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", item))
        })
        .collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
