use std::sync::OnceLock;

use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub use crate::storage::FOLDER_ICON;

pub fn file_icon(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "svg" | "webp" => "🖼️",
        "mp3" | "wav" | "flac" | "ogg" | "m4a" => "🎵",
        "mp4" | "mkv" | "avi" | "mov" | "webm" => "🎬",
        "zip" | "rar" | "7z" | "tar" | "gz" | "xz" => "📦",
        "pdf" => "📕",
        "xls" | "xlsx" | "csv" | "ods" => "📊",
        "doc" | "docx" | "txt" | "md" | "odt" | "rtf" => "📝",
        _ => "📄",
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn local_offset() -> UtcOffset {
    static OFFSET: OnceLock<UtcOffset> = OnceLock::new();
    *OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
}

/// Renders a unix timestamp in the server's local time zone.
pub fn format_timestamp(unix: i64) -> String {
    format_timestamp_at(unix, local_offset())
}

pub fn format_timestamp_at(unix: i64, offset: UtcOffset) -> String {
    let Ok(at) = OffsetDateTime::from_unix_timestamp(unix) else {
        return String::new();
    };
    at.to_offset(offset)
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::offset;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(5), "5 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn timestamps_use_given_offset() {
        assert_eq!(format_timestamp_at(0, UtcOffset::UTC), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp_at(0, offset!(+3)), "1970-01-01 03:00:00");
    }

    #[test]
    fn icons_follow_extension() {
        assert_eq!(file_icon("photo.JPG"), "🖼️");
        assert_eq!(file_icon("report.pdf"), "📕");
        assert_eq!(file_icon("Makefile"), "📄");
    }
}
