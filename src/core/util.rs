use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::error::{UpdaterError, UpdaterResult};

/// The compressed catalog filename, both locally and on every update site.
pub const XML_COMPRESSED: &str = "db.xml.gz";

// ── 14-digit timestamps ─────────────────────────────────
// The canonical version identifier is the decimal string YYYYMMDDhhmmss of a
// local wall-clock time, parsed into a u64. This is NOT a Unix epoch.

pub fn timestamp_of(date: &DateTime<Local>) -> u64 {
    (date.year() as u64) * 10_000_000_000
        + (date.month() as u64) * 100_000_000
        + (date.day() as u64) * 1_000_000
        + (date.hour() as u64) * 10_000
        + (date.minute() as u64) * 100
        + date.second() as u64
}

pub fn current_timestamp() -> u64 {
    timestamp_of(&Local::now())
}

pub fn timestamp_from_system(time: SystemTime) -> u64 {
    timestamp_of(&DateTime::<Local>::from(time))
}

pub fn timestamp_from_millis(millis: i64) -> u64 {
    match Local.timestamp_millis_opt(millis).single() {
        Some(date) => timestamp_of(&date),
        None => 0,
    }
}

/// The mtime of a file as a 14-digit timestamp (second resolution).
pub fn file_timestamp(path: &Path) -> UpdaterResult<u64> {
    let metadata = std::fs::metadata(path).map_err(UpdaterError::io(path))?;
    let modified = metadata.modified().map_err(UpdaterError::io(path))?;
    Ok(timestamp_from_system(modified))
}

const MONTHS: [&str; 13] = [
    "Zero", "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

pub fn pretty_timestamp(timestamp: u64) -> String {
    let t = format!("{timestamp}00000000000000");
    let month: usize = t[4..6].parse().unwrap_or(0);
    format!(
        "{} {} {} {}:{}:{}",
        &t[6..8],
        MONTHS.get(month).unwrap_or(&"Zero"),
        &t[0..4],
        &t[8..10],
        &t[10..12],
        &t[12..14]
    )
}

// ── Filename handling ───────────────────────────────────

static VERSIONED_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+?)(-\d+(\.\d+)*(-[A-Za-z0-9._]+)*)?(\.[A-Za-z0-9]+)?$")
        .expect("hard-coded pattern")
});

/// Strip a `-<version>` suffix before the extension, if present.
///
/// `jars/bio-formats-6.0.1.jar` → `jars/bio-formats.jar`;
/// unversioned names pass through unchanged.
pub fn strip_filename_version(filename: &str) -> String {
    match VERSIONED_FILENAME.captures(filename) {
        Some(caps) => {
            let base = caps.get(1).map_or("", |m| m.as_str());
            let ext = caps.get(5).map_or("", |m| m.as_str());
            format!("{base}{ext}")
        }
        None => filename.to_string(),
    }
}

/// Sibling paths carrying a different version of the same file.
pub fn all_versions_of(dir: &Path, filename: &str) -> Vec<std::path::PathBuf> {
    let stripped = strip_filename_version(filename);
    let mut result = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return result;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if strip_filename_version(&name) == stripped {
            result.push(entry.path());
        }
    }
    result
}

/// The site-relative download URL suffix: spaces are percent-encoded, the
/// 14-digit timestamp is the version marker.
pub fn versioned_url(base: &str, filename: &str, timestamp: u64) -> String {
    format!("{}{}-{}", base, filename.replace(' ', "%20"), timestamp)
}

pub fn join<T: std::fmt::Display>(delimiter: &str, items: impl IntoIterator<Item = T>) -> String {
    let mut result = String::new();
    for item in items {
        if !result.is_empty() {
            result.push_str(delimiter);
        }
        result.push_str(&item.to_string());
    }
    result
}

/// Create the file (and its parents) if missing, else bump its mtime.
/// Zero-length placeholders under `update/` mark pending deletions.
pub fn touch(path: &Path) -> UpdaterResult<()> {
    if path.exists() {
        filetime::set_file_mtime(path, filetime::FileTime::now())
            .map_err(UpdaterError::io(path))?;
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(UpdaterError::io(parent))?;
        }
        std::fs::File::create(path).map_err(UpdaterError::io(path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_simple_version() {
        assert_eq!(strip_filename_version("macros/hello-2.ijm"), "macros/hello.ijm");
        assert_eq!(
            strip_filename_version("jars/bio-formats-6.0.1.jar"),
            "jars/bio-formats.jar"
        );
    }

    #[test]
    fn strips_snapshot_suffix() {
        assert_eq!(
            strip_filename_version("jars/engine-1.2.3-SNAPSHOT.jar"),
            "jars/engine.jar"
        );
    }

    #[test]
    fn keeps_unversioned_names() {
        assert_eq!(strip_filename_version("spectra-linux-x64"), "spectra-linux-x64");
        assert_eq!(strip_filename_version("jars/commons-io.jar"), "jars/commons-io.jar");
    }

    #[test]
    fn hyphenated_basenames_survive() {
        assert_eq!(
            strip_filename_version("jars/commons-io-2.11.0.jar"),
            "jars/commons-io.jar"
        );
    }

    #[test]
    fn timestamp_digits() {
        let ts = current_timestamp();
        assert_eq!(ts.to_string().len(), 14);
    }

    #[test]
    fn pretty_prints_timestamp() {
        assert_eq!(pretty_timestamp(20240101123456), "01 Jan 2024 12:34:56");
    }

    #[test]
    fn versioned_url_encodes_spaces() {
        assert_eq!(
            versioned_url("https://example.org/", "plugins/My Plugin.jar", 20240101000000),
            "https://example.org/plugins/My%20Plugin.jar-20240101000000"
        );
    }
}
