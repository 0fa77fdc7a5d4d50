use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use tracing::debug;

/// The `.checksums` digest cache.
///
/// Two kinds of entries share the file: path-keyed lines record the digest
/// computed at a given mtime, and digest-keyed lines (path prefixed with
/// `:`) record the colon-joined legacy equivalents of a current digest.
/// Each line is `<digest> <timestamp> <path>`.
#[derive(Default)]
pub struct ChecksumCache {
    entries: BTreeMap<String, CachedVersion>,
}

#[derive(Debug, Clone)]
pub struct CachedVersion {
    pub checksum: String,
    pub timestamp: u64,
}

impl ChecksumCache {
    pub fn load(path: &Path) -> Self {
        let mut cache = Self::default();
        let Ok(contents) = std::fs::read_to_string(path) else {
            return cache;
        };
        for line in contents.lines() {
            let Some((checksum, rest)) = line.split_once(' ') else {
                continue;
            };
            let Some((timestamp, filename)) = rest.split_once(' ') else {
                continue;
            };
            let Ok(timestamp) = timestamp.parse::<u64>() else {
                continue;
            };
            cache.entries.insert(
                filename.to_string(),
                CachedVersion {
                    checksum: checksum.to_string(),
                    timestamp,
                },
            );
        }
        cache
    }

    /// Persist, dropping path-keyed entries whose file vanished.
    pub fn save(&self, path: &Path, exists: impl Fn(&str) -> bool) {
        let mut contents = String::new();
        for (filename, version) in &self.entries {
            if filename.starts_with(':') || exists(filename) {
                let _ = writeln!(
                    contents,
                    "{} {} {}",
                    version.checksum, version.timestamp, filename
                );
            }
        }
        if let Err(error) = std::fs::write(path, contents) {
            debug!("Could not write checksum cache {path:?}: {error}");
        }
    }

    pub fn get(&self, filename: &str) -> Option<&CachedVersion> {
        self.entries.get(filename)
    }

    pub fn insert(&mut self, filename: &str, checksum: &str, timestamp: u64) {
        self.entries.insert(
            filename.to_string(),
            CachedVersion {
                checksum: checksum.to_string(),
                timestamp,
            },
        );
    }

    pub fn has_equivalents(&self, digest: &str) -> bool {
        self.entries.contains_key(&format!(":{digest}"))
    }

    /// Legacy digests equivalent to a current digest.
    pub fn equivalents(&self, digest: &str) -> Option<Vec<String>> {
        let entry = self.entries.get(&format!(":{digest}"))?;
        Some(entry.checksum.split(':').map(String::from).collect())
    }

    pub fn set_equivalents(&mut self, digest: &str, equivalents: &[String], timestamp: u64) {
        self.entries.insert(
            format!(":{digest}"),
            CachedVersion {
                checksum: equivalents.join(":"),
                timestamp,
            },
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CachedVersion)> {
        self.entries.iter()
    }
}
