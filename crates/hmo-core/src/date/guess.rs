use chrono::{NaiveDate, NaiveDateTime};
use regex::{Captures, Regex};
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// The file name matches none of the known camera/phone naming conventions,
/// or the convention it matches carries an impossible date.
#[derive(Debug, Error)]
#[error("cannot extract date from filename {0}")]
pub struct NoDateError(pub String);

/// How the capture groups of a template map onto date fields.
#[derive(Clone, Copy, Debug)]
enum Layout {
    /// year, month, day, hour, minute, second
    Full,
    /// year, month, day, hour, minute
    NoSeconds,
    /// year, month, day
    Date,
    /// year, month, day, free text; a leading HHMMSS in the text is the time
    DateRest,
}

struct DatePattern {
    regex: &'static LazyLock<Regex>,
    layout: Layout,
}

static RE_DASHED_DOTTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2})_(\d{2})\.(\d{2})\.(\d{2})$").unwrap()
});
static RE_VIDEO_DOTTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^video-?(\d{4})\.(\d{2})\.(\d{2})_(\d{2})-(\d{2})-(\d{2})$").unwrap()
});
static RE_COMPACT_REST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})[_-](.*)$").unwrap());
static RE_COMPACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").unwrap());
static RE_IMG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^IMG_(\d{4})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})$").unwrap()
});
static RE_IMG_BURST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^IMG_(\d{4})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})_\d$").unwrap()
});
static RE_VID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^VID_(\d{4})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})$").unwrap()
});
static RE_PXL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PXL_(\d{4})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})\d{3}$").unwrap()
});
static RE_VIDEO_REST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^video-(\d{4})[.-](\d{1,2})[.-](\d{1,2})-(.+)$").unwrap()
});
static RE_SHORT_REST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})[.-](\d{1,2})[.-](\d{1,2})-(.+)$").unwrap());
static RE_DASHED_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})-(.{1,3})$").unwrap());
static RE_SHORT_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})-(\d{2})-(\d{2})_(.+)$").unwrap());
static RE_VIDEO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^video-(\d{4})-(\d{2})-(\d{2})$").unwrap());
static RE_VOICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^voice-(\d{4})-(\d{2})-(\d{2})-(\d{2})-(\d{2})$").unwrap()
});
static RE_SCREENSHOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[_-](\d{4})(\d{2})(\d{2})-(\d{2})(\d{2})(\d{2})(?:\D|$)").unwrap()
});
static RE_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-(\d{4})-(\d{2})-(\d{2})-(\d{2})(\d{2})(\d{2})(?:\D|$)").unwrap()
});
static RE_LEADING_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})(\d{2})(\d{2})").unwrap());

/// Templates in priority order. The first template whose regex matches decides
/// the outcome; later templates are never consulted.
static PATTERNS: &[DatePattern] = &[
    DatePattern { regex: &RE_DASHED_DOTTED, layout: Layout::Full },
    DatePattern { regex: &RE_VIDEO_DOTTED, layout: Layout::Full },
    DatePattern { regex: &RE_COMPACT_REST, layout: Layout::DateRest },
    DatePattern { regex: &RE_COMPACT, layout: Layout::Date },
    DatePattern { regex: &RE_IMG, layout: Layout::Full },
    DatePattern { regex: &RE_IMG_BURST, layout: Layout::Full },
    DatePattern { regex: &RE_VID, layout: Layout::Full },
    DatePattern { regex: &RE_PXL, layout: Layout::Full },
    DatePattern { regex: &RE_VIDEO_REST, layout: Layout::DateRest },
    DatePattern { regex: &RE_SHORT_REST, layout: Layout::DateRest },
    DatePattern { regex: &RE_DASHED_TAG, layout: Layout::DateRest },
    DatePattern { regex: &RE_SHORT_UNDERSCORE, layout: Layout::DateRest },
    DatePattern { regex: &RE_VIDEO_DATE, layout: Layout::Date },
    DatePattern { regex: &RE_VOICE, layout: Layout::NoSeconds },
    DatePattern { regex: &RE_SCREENSHOT, layout: Layout::Full },
    DatePattern { regex: &RE_SIGNAL, layout: Layout::Full },
];

/// Extract the capture date encoded in a file name.
///
/// Only the base name is inspected and the extension is stripped before
/// matching. Two-digit years are taken as `20YY`.
pub fn date_from_filename(filename: &str) -> Result<NaiveDateTime, NoDateError> {
    let path = Path::new(filename);
    let stem: String = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .nfc()
        .collect();

    for pat in PATTERNS {
        if let Some(caps) = pat.regex.captures(&stem) {
            return fields(&caps, pat.layout)
                .and_then(|(y, mo, d, h, mi, s)| {
                    NaiveDate::from_ymd_opt(y, mo, d)?.and_hms_opt(h, mi, s)
                })
                .ok_or_else(|| NoDateError(filename.to_string()));
        }
    }

    Err(NoDateError(filename.to_string()))
}

fn fields(caps: &Captures, layout: Layout) -> Option<(i32, u32, u32, u32, u32, u32)> {
    let num = |i: usize| -> Option<u32> { caps.get(i)?.as_str().parse().ok() };

    let year_text = caps.get(1)?.as_str();
    let mut year: i32 = year_text.parse().ok()?;
    if year_text.len() == 2 {
        year += 2000;
    }
    let (month, day) = (num(2)?, num(3)?);

    let (hour, minute, second) = match layout {
        Layout::Full => (num(4)?, num(5)?, num(6)?),
        Layout::NoSeconds => (num(4)?, num(5)?, 0),
        Layout::Date => (0, 0, 0),
        Layout::DateRest => time_from_rest(caps.get(4).map_or("", |m| m.as_str())),
    };

    Some((year, month, day, hour, minute, second))
}

/// Time of day from free text following the date, e.g. `143000` in
/// `20210615_143000`. Anything else means midnight.
fn time_from_rest(rest: &str) -> (u32, u32, u32) {
    RE_LEADING_TIME
        .captures(rest)
        .and_then(|c| {
            let h: u32 = c[1].parse().ok()?;
            let m: u32 = c[2].parse().ok()?;
            let s: u32 = c[3].parse().ok()?;
            (h < 24 && m < 60 && s < 60).then_some((h, m, s))
        })
        .unwrap_or((0, 0, 0))
}
