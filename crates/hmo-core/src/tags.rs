use std::fmt::Write as _;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::manifest::{ManifestEntry, TagMap};
use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown format {:?}, expected json or text", other)),
        }
    }
}

/// Same metadata attached to each tag name.
pub fn build_tags(names: &[String], metadata: &Metadata) -> TagMap {
    let meta: Map<String, Value> = metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    names
        .iter()
        .map(|n| (n.clone(), Value::Object(meta.clone())))
        .collect()
}

pub fn render_metadata(metadata: &Metadata, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(metadata)?,
        OutputFormat::Text => {
            let mut out = String::new();
            for (k, v) in metadata {
                writeln!(out, "{}={}", k, v)?;
            }
            out
        }
    })
}

/// JSON: `{path: {tag: metadata}}`. Text: one `path: tag, tag` line per file.
pub fn render_tags(entries: &[ManifestEntry], format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json => {
            let all: Map<String, Value> = entries
                .iter()
                .map(|e| {
                    (
                        e.path.to_string_lossy().into_owned(),
                        Value::Object(e.tags.clone()),
                    )
                })
                .collect();
            serde_json::to_string_pretty(&all)?
        }
        OutputFormat::Text => {
            let mut out = String::new();
            for e in entries {
                let names: Vec<&str> = e.tags.keys().map(String::as_str).collect();
                writeln!(out, "{}: {}", e.path.display(), names.join(", "))?;
            }
            out
        }
    })
}
