pub mod exif;
pub mod guess;

use std::fmt;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use log::debug;
use regex::Regex;

use crate::metadata::MetadataBackend;

/// One way of deriving a capture date for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// `DateTimeOriginal` read directly from the image container.
    EmbeddedMetadata,
    /// First populated key of [`EXTERNAL_DATE_KEYS`] from the metadata backend.
    ExternalTool,
    /// Camera/phone naming conventions, see [`guess::date_from_filename`].
    FilenamePattern,
}

use Strategy::{EmbeddedMetadata, ExternalTool, FilenamePattern};

/// Keys consulted by [`Strategy::ExternalTool`], in order.
pub const EXTERNAL_DATE_KEYS: &[&str] = &[
    "QuickTime:MediaModifyDate",
    "QuickTime:MediaCreateDate",
    "EXIF:DateTimeOriginal",
    "Composite:DateTimeOriginal",
];

/// Per-extension strategy order. Extensions are stored lower-case without
/// the leading dot.
static STRATEGY_TABLE: &[(&str, &[Strategy])] = &[
    ("jpg", &[EmbeddedMetadata, ExternalTool, FilenamePattern]),
    ("jpeg", &[EmbeddedMetadata, ExternalTool, FilenamePattern]),
    ("tiff", &[EmbeddedMetadata]),
    ("cr2", &[FilenamePattern, ExternalTool, EmbeddedMetadata]),
    ("mp4", &[ExternalTool, FilenamePattern]),
    ("mov", &[ExternalTool]),
    ("3gp", &[FilenamePattern, ExternalTool]),
    ("m4a", &[ExternalTool, FilenamePattern]),
    ("mpg", &[ExternalTool, FilenamePattern]),
    ("mp3", &[ExternalTool, FilenamePattern]),
    ("wmv", &[ExternalTool, FilenamePattern]),
    ("wav", &[ExternalTool, FilenamePattern]),
    ("avi", &[ExternalTool, FilenamePattern]),
    ("heic", &[ExternalTool, FilenamePattern]),
];

/// Strategy order for an extension (without dot), ignoring case.
pub fn strategies_for(ext: &str) -> Option<&'static [Strategy]> {
    let ext = ext.to_ascii_lowercase();
    STRATEGY_TABLE
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, strategies)| *strategies)
}

/// Whether files with this extension (without dot) are media files.
///
/// Only the all-lower-case and all-upper-case spellings are recognized, so
/// `jpg` and `JPG` qualify while `Jpg` does not.
pub fn is_media_extension(ext: &str) -> bool {
    STRATEGY_TABLE
        .iter()
        .any(|(known, _)| *known == ext || known.to_ascii_uppercase() == ext)
}

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(2\d{7})(?:_(\d{6}))?").unwrap());

/// Canonical `YYYYMMDD_HHMMSS` date label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateLabel(String);

impl DateLabel {
    /// Label used when no strategy yields a usable date.
    pub const SENTINEL: &'static str = "19000101_000000";

    pub fn sentinel() -> Self {
        Self(Self::SENTINEL.to_string())
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self(dt.format("%Y%m%d_%H%M%S").to_string())
    }

    /// Normalize a raw strategy result such as `2021:06:15 14:30:00+02:00`.
    ///
    /// Colons are stripped and spaces become underscores. The result must
    /// start with `2YYYYMMDD`; a bare date gets a midnight time, and anything
    /// after the seconds (sub-seconds, zone offsets) is dropped.
    pub fn normalize(raw: &str) -> Option<Self> {
        let cleaned = raw.trim().replace(':', "").replace(' ', "_");
        let caps = LABEL_RE.captures(&cleaned)?;
        let date = caps.get(1)?.as_str();
        let time = caps.get(2).map_or("000000", |m| m.as_str());
        Some(Self(format!("{}_{}", date, time)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == Self::SENTINEL
    }

    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, "%Y%m%d_%H%M%S").ok()
    }

    /// Render the label with a strftime-style format. The default format
    /// returns the label itself.
    pub fn format(&self, format: &str) -> anyhow::Result<String> {
        if format == "%Y%m%d_%H%M%S" {
            return Ok(self.0.clone());
        }
        let dt = self
            .to_datetime()
            .ok_or_else(|| anyhow::anyhow!("date label {} is not a valid date", self.0))?;
        format_datetime(&dt, format)
    }
}

impl fmt::Display for DateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// strftime-style formatting that reports bad format strings instead of
/// panicking.
pub fn format_datetime(dt: &NaiveDateTime, format: &str) -> anyhow::Result<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(format))
        .map_err(|_| anyhow::anyhow!("invalid date format {:?}", format))?;
    Ok(out)
}

/// Derives date labels by trying each strategy of a file's extension in turn.
pub struct DateResolver<'a> {
    backend: &'a dyn MetadataBackend,
}

impl<'a> DateResolver<'a> {
    pub fn new(backend: &'a dyn MetadataBackend) -> Self {
        Self { backend }
    }

    /// Resolve the date label of a file, falling back to
    /// [`DateLabel::SENTINEL`] when every strategy fails.
    pub fn resolve(&self, path: &Path) -> DateLabel {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let Some(strategies) = strategies_for(ext) else {
            debug!("{}: no date strategies for extension {:?}", path.display(), ext);
            return DateLabel::sentinel();
        };

        for &strategy in strategies {
            match self.run(strategy, path) {
                Ok(Some(raw)) if raw.is_empty() => continue,
                Ok(Some(raw)) => {
                    if !raw.starts_with('2') {
                        debug!("{}: {:?} gave invalid date {}", path.display(), strategy, raw);
                        continue;
                    }
                    match DateLabel::normalize(&raw) {
                        Some(label) => return label,
                        None => {
                            debug!("{}: {:?} gave malformed date {}", path.display(), strategy, raw)
                        }
                    }
                }
                Ok(None) => continue,
                Err(e) => debug!("{}: {:?} failed: {:#}", path.display(), strategy, e),
            }
        }

        DateLabel::sentinel()
    }

    fn run(&self, strategy: Strategy, path: &Path) -> anyhow::Result<Option<String>> {
        match strategy {
            Strategy::EmbeddedMetadata => exif::embedded_date(path),
            Strategy::ExternalTool => {
                let metadata = self.backend.read(path)?;
                Ok(EXTERNAL_DATE_KEYS
                    .iter()
                    .find_map(|key| metadata.get(*key).cloned()))
            }
            Strategy::FilenamePattern => {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let dt = guess::date_from_filename(name)?;
                Ok(Some(DateLabel::from_datetime(&dt).0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Metadata, StaticBackend};
    use std::fs;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            strategies_for("JPG"),
            Some(&[EmbeddedMetadata, ExternalTool, FilenamePattern][..])
        );
        assert_eq!(strategies_for("mov"), Some(&[ExternalTool][..]));
        assert_eq!(strategies_for("3gp"), Some(&[FilenamePattern, ExternalTool][..]));
        assert_eq!(strategies_for("txt"), None);
    }

    #[test]
    fn test_media_extension_case() {
        assert!(is_media_extension("jpg"));
        assert!(is_media_extension("JPG"));
        assert!(is_media_extension("HEIC"));
        assert!(is_media_extension("heic"));
        assert!(!is_media_extension("Jpg"));
        assert!(!is_media_extension("png"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            DateLabel::normalize("2021:06:15 14:30:00").unwrap().as_str(),
            "20210615_143000"
        );
        assert_eq!(
            DateLabel::normalize("2021:06:15 14:30:00+02:00").unwrap().as_str(),
            "20210615_143000"
        );
        assert_eq!(DateLabel::normalize("2021:06:15").unwrap().as_str(), "20210615_000000");
        assert_eq!(
            DateLabel::normalize("20210615_143000").unwrap().as_str(),
            "20210615_143000"
        );
        assert!(DateLabel::normalize("0000:00:00 00:00:00").is_none());
        assert!(DateLabel::normalize("garbage").is_none());
    }

    #[test]
    fn test_label_format() {
        let label = DateLabel::normalize("2021:06:15 14:30:00").unwrap();
        assert_eq!(label.format("%Y%m%d_%H%M%S").unwrap(), "20210615_143000");
        assert_eq!(label.format("%Y/%m").unwrap(), "2021/06");
        assert!(label.format("%Q").is_err());
    }

    #[test]
    fn test_external_tool_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mov");
        fs::write(&path, b"").unwrap();

        let backend = StaticBackend::new();
        backend.insert(
            &path,
            meta(&[
                ("EXIF:DateTimeOriginal", "2019:01:01 00:00:00"),
                ("QuickTime:MediaCreateDate", "2020:02:02 02:02:02"),
            ]),
        );
        let resolver = DateResolver::new(&backend);
        assert_eq!(resolver.resolve(&path).as_str(), "20200202_020202");
    }

    #[test]
    fn test_rejects_dates_not_starting_with_two() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VID_20180304_050607.mp4");
        fs::write(&path, b"").unwrap();

        let backend = StaticBackend::new();
        backend.insert(&path, meta(&[("QuickTime:MediaModifyDate", "0000:00:00 00:00:00")]));
        let resolver = DateResolver::new(&backend);
        // the bogus metadata date is skipped in favour of the file name
        assert_eq!(resolver.resolve(&path).as_str(), "20180304_050607");
    }

    #[test]
    fn test_falls_back_to_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holiday.mov");
        fs::write(&path, b"").unwrap();

        let backend = StaticBackend::new();
        backend.insert(&path, meta(&[("QuickTime:MediaModifyDate", "1904:01:01 00:00:00")]));
        let label = DateResolver::new(&backend).resolve(&path);
        assert!(label.is_sentinel());
        assert_eq!(label.as_str(), DateLabel::SENTINEL);
    }

    #[test]
    fn test_jpg_without_exif_uses_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_20210615_143000.jpg");
        fs::write(&path, b"no exif here").unwrap();

        let backend = StaticBackend::new();
        let label = DateResolver::new(&backend).resolve(&path);
        assert_eq!(label.as_str(), "20210615_143000");
    }

    #[test]
    fn test_embedded_date_wins_over_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_20190101_000000.jpg");
        fs::write(&path, super::exif::jpeg_with_date_original("2021:06:15 14:30:00")).unwrap();

        let backend = StaticBackend::new();
        backend.insert(&path, meta(&[("EXIF:DateTimeOriginal", "2020:01:01 00:00:00")]));
        let label = DateResolver::new(&backend).resolve(&path);
        assert_eq!(label.as_str(), "20210615_143000");
    }

    #[test]
    fn test_bogus_embedded_date_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StaticBackend::new();

        // to the external tool
        let tagged = dir.path().join("scan.jpg");
        fs::write(&tagged, super::exif::jpeg_with_date_original("1900:01:01 00:00:00")).unwrap();
        backend.insert(&tagged, meta(&[("EXIF:DateTimeOriginal", "2005:07:08 09:10:11")]));
        assert_eq!(
            DateResolver::new(&backend).resolve(&tagged).as_str(),
            "20050708_091011"
        );

        // and on to the file name
        let named = dir.path().join("IMG_20210615_143000.jpg");
        fs::write(&named, super::exif::jpeg_with_date_original("0000:00:00 00:00:00")).unwrap();
        assert_eq!(
            DateResolver::new(&backend).resolve(&named).as_str(),
            "20210615_143000"
        );

        // a tiff has nothing else to try
        let tiff = dir.path().join("IMG_20210615_143000.tiff");
        fs::write(&tiff, super::exif::jpeg_with_date_original("1980:01:01 00:00:00")).unwrap();
        assert!(DateResolver::new(&backend).resolve(&tiff).is_sentinel());
    }

    #[test]
    fn test_output_is_sentinel_or_starts_with_two() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StaticBackend::new();
        let bogus = ["1900:01:01 00:00:00", "0000:00:00 00:00:00", "", "2019:05:05 05:05:05"];
        for (ext, _) in STRATEGY_TABLE {
            for (i, value) in bogus.iter().enumerate() {
                let path = dir.path().join(format!("file{}.{}", i, ext));
                fs::write(&path, b"").unwrap();
                backend.insert(&path, meta(&[("EXIF:DateTimeOriginal", value)]));
                let label = DateResolver::new(&backend).resolve(&path);
                assert!(
                    label.is_sentinel() || label.as_str().starts_with('2'),
                    "{} -> {}",
                    path.display(),
                    label
                );
            }
        }
    }
}
