//! Index file naming.
//!
//! ```text
//! segments_<gen>              commit point (gen in base 36)
//! pending_segments_<gen>      prepared but not yet activated commit
//! _<seg>.<ext>                per-segment file
//! _<seg>_<gen>.<ext>          generational per-segment file (liv, fnm, dvu)
//! write.lock                  writer lock
//! ```

use crate::error::{QuireError, Result};

pub const SEGMENTS: &str = "segments";
pub const PENDING_SEGMENTS: &str = "pending_segments";

pub const SEGMENT_INFO_EXTENSION: &str = "si";
pub const FIELD_INFOS_EXTENSION: &str = "fnm";
pub const POSTINGS_EXTENSION: &str = "pst";
pub const STORED_FIELDS_EXTENSION: &str = "fdt";
pub const NORMS_EXTENSION: &str = "nrm";
pub const DOC_VALUES_EXTENSION: &str = "dvd";
pub const LIVE_DOCS_EXTENSION: &str = "liv";
pub const DOC_VALUES_UPDATE_EXTENSION: &str = "dvu";

/// Encode a non-negative number in base 36.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn from_base36(text: &str) -> Result<u64> {
    u64::from_str_radix(text, 36)
        .map_err(|e| QuireError::corrupt(format!("invalid base 36 number \"{text}\": {e}")))
}

/// Segment name for a counter value, e.g. `_a`.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_base36(counter))
}

/// `<segment>.<ext>`
pub fn segment_file_name(segment: &str, extension: &str) -> String {
    format!("{segment}.{extension}")
}

/// File name for a generation: `None` for -1, `base[.ext]` for 0, else
/// `base_<gen36>[.ext]`.
pub fn file_name_from_generation(base: &str, extension: &str, generation: i64) -> Option<String> {
    match generation {
        g if g < 0 => None,
        0 if extension.is_empty() => Some(base.to_string()),
        0 => Some(format!("{base}.{extension}")),
        g if extension.is_empty() => Some(format!("{base}_{}", to_base36(g as u64))),
        g => Some(format!("{base}_{}.{extension}", to_base36(g as u64))),
    }
}

/// `segments_<gen>`
pub fn segments_file_name(generation: i64) -> String {
    file_name_from_generation(SEGMENTS, "", generation).unwrap_or_else(|| SEGMENTS.to_string())
}

/// `pending_segments_<gen>`
pub fn pending_segments_file_name(generation: i64) -> String {
    file_name_from_generation(PENDING_SEGMENTS, "", generation)
        .unwrap_or_else(|| PENDING_SEGMENTS.to_string())
}

/// Generation encoded in a `segments_N` name.
pub fn generation_from_segments_file_name(name: &str) -> Result<i64> {
    if name == SEGMENTS {
        return Ok(0);
    }
    let suffix = name
        .strip_prefix("segments_")
        .ok_or_else(|| QuireError::invalid_argument(format!("not a segments file: {name}")))?;
    Ok(from_base36(suffix)? as i64)
}

pub fn is_segments_file(name: &str) -> bool {
    name.starts_with("segments_") && generation_from_segments_file_name(name).is_ok()
}

pub fn is_pending_segments_file(name: &str) -> bool {
    name.starts_with("pending_segments_")
}

/// Segment name prefix of a per-segment file: `_3_1.liv` -> `_3`.
pub fn parse_segment_name(file: &str) -> Option<&str> {
    if !file.starts_with('_') {
        return None;
    }
    let rest = &file[1..];
    let end = rest
        .find(|c: char| c == '_' || c == '.')
        .map(|i| i + 1)
        .unwrap_or(file.len());
    Some(&file[..end])
}

/// Generation of a generational per-segment file, if any.
pub fn parse_generation(file: &str) -> Option<i64> {
    let segment = parse_segment_name(file)?;
    let rest = file[segment.len()..].strip_prefix('_')?;
    let digits = rest.split('.').next()?;
    from_base36(digits).ok().map(|g| g as i64)
}

/// Whether a file name belongs to the index (and may be deleted by it).
pub fn is_index_file(name: &str) -> bool {
    name.starts_with('_') || is_segments_file(name) || is_pending_segments_file(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("10").unwrap(), 36);
        assert!(from_base36("!").is_err());
    }

    #[test]
    fn test_generation_names() {
        assert_eq!(file_name_from_generation("segments", "", -1), None);
        assert_eq!(segments_file_name(1), "segments_1");
        assert_eq!(segments_file_name(36), "segments_10");
        assert_eq!(pending_segments_file_name(2), "pending_segments_2");
        assert_eq!(
            file_name_from_generation("_0", "liv", 2),
            Some("_0_2.liv".to_string())
        );
        assert_eq!(generation_from_segments_file_name("segments_10").unwrap(), 36);
        assert!(is_segments_file("segments_5"));
        assert!(!is_segments_file("segments_x!"));
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("_3.pst"), Some("_3"));
        assert_eq!(parse_segment_name("_a1_2.liv"), Some("_a1"));
        assert_eq!(parse_segment_name("segments_1"), None);
        assert_eq!(parse_generation("_a1_2.liv"), Some(2));
        assert_eq!(parse_generation("_a1.pst"), None);
        assert_eq!(segment_name(10), "_a");
    }
}
