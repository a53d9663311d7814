use exif::{In, Reader, Tag, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Read the original-capture timestamp (EXIF tag 36867, `DateTimeOriginal`)
/// straight from the image container.
///
/// Returns the raw tag text, e.g. `2021:06:15 14:30:00`, or `None` when the
/// container has EXIF data but no such tag.
pub fn embedded_date(path: &Path) -> anyhow::Result<Option<String>> {
    let file = File::open(path)?;
    let exif = Reader::new().read_from_container(&mut BufReader::new(file))?;

    let Some(field) = exif.get_field(Tag::DateTimeOriginal, In::PRIMARY) else {
        return Ok(None);
    };

    let text = match &field.value {
        Value::Ascii(parts) => parts
            .first()
            .map(|raw| String::from_utf8_lossy(raw).trim().to_string()),
        _ => Some(field.display_value().to_string()),
    };
    Ok(text.filter(|s| !s.is_empty()))
}

/// Minimal JPEG whose EXIF block holds only `DateTimeOriginal`.
#[cfg(test)]
pub(crate) fn jpeg_with_date_original(date: &str) -> Vec<u8> {
    assert_eq!(date.len(), 19, "EXIF dates are `YYYY:MM:DD HH:MM:SS`");
    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"MM\0\x2a");
    tiff.extend_from_slice(&8u32.to_be_bytes());
    // IFD0: pointer to the Exif IFD at 26
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x8769u16.to_be_bytes());
    tiff.extend_from_slice(&4u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&26u32.to_be_bytes());
    tiff.extend_from_slice(&0u32.to_be_bytes());
    // Exif IFD: DateTimeOriginal, ASCII, text at 44
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x9003u16.to_be_bytes());
    tiff.extend_from_slice(&2u16.to_be_bytes());
    tiff.extend_from_slice(&20u32.to_be_bytes());
    tiff.extend_from_slice(&44u32.to_be_bytes());
    tiff.extend_from_slice(&0u32.to_be_bytes());
    tiff.extend_from_slice(date.as_bytes());
    tiff.push(0);

    let mut jpeg = vec![0xff, 0xd8, 0xff, 0xe1];
    jpeg.extend_from_slice(&(tiff.len() as u16 + 8).to_be_bytes());
    jpeg.extend_from_slice(b"Exif\0\0");
    jpeg.extend_from_slice(&tiff);
    jpeg.extend_from_slice(&[0xff, 0xd9]);
    jpeg
}
