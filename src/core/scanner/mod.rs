mod cache;

pub use cache::ChecksumCache;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::error;
use walkdir::WalkDir;

use crate::core::conflicts::{Conflict, Resolution, ResolutionEffect, Severity};
use crate::core::error::UpdaterResult;
use crate::core::hasher;
use crate::core::model::{FileRecord, FilesCollection, Status};
use crate::core::platform;
use crate::core::progress::Progress;
use crate::core::util;

/// Top-level directory → recognized extensions. An empty string admits any
/// extension (and extensionless files).
const DIRECTORIES: &[(&str, &[&str])] = &[
    ("jars", &[".jar", ".class"]),
    (
        "plugins",
        &[
            ".jar", ".class", ".txt", ".ijm", ".py", ".rb", ".clj", ".js", ".bsh", ".groovy",
            ".gvy",
        ],
    ),
    (
        "scripts",
        &[".m", ".ijm", ".py", ".rb", ".clj", ".js", ".bsh", ".groovy", ".gvy"],
    ),
    ("macros", &[".txt", ".ijm", ".png"]),
    ("models", &[""]),
    ("luts", &[".lut"]),
    ("images", &[".png", ".tif", ".txt", ".ico"]),
    ("Contents", &[".icns", ".plist"]),
    ("lib", &[""]),
    ("config", &[""]),
    ("licenses", &[""]),
];

struct Candidate {
    path: String,
    file: PathBuf,
    timestamp: u64,
    checksum: Option<String>,
}

/// Walks the installation, digests every recognized file and feeds the
/// results into the collection: local digests and timestamps on known
/// records, fresh `LOCAL_ONLY` records for untracked files, demotions for
/// records whose files vanished. Multi-version collisions become conflicts.
pub struct Checksummer<'a> {
    files: &'a mut FilesCollection,
    progress: &'a mut dyn Progress,
    cache: ChecksumCache,
    queue: Vec<(String, Vec<Candidate>)>,
    counter: u64,
    total: u64,
}

impl<'a> Checksummer<'a> {
    pub fn new(files: &'a mut FilesCollection, progress: &'a mut dyn Progress) -> Self {
        let cache = ChecksumCache::load(&files.prefix(".checksums"));
        Self {
            files,
            progress,
            cache,
            queue: Vec::new(),
            counter: 0,
            total: 0,
        }
    }

    pub fn cache(&self) -> &ChecksumCache {
        &self.cache
    }

    /// Scan the whole installation.
    pub fn update_from_local(&mut self) -> UpdaterResult<()> {
        self.progress.set_title("Checksummer");
        self.initialize_queue();
        self.handle_queue()
    }

    /// Re-checksum only the given paths (e.g. after re-reading one site).
    pub fn update_some(&mut self, paths: &[String]) -> UpdaterResult<()> {
        self.progress.set_title("Checksummer");
        self.queue.clear();
        for path in paths {
            self.queue_path(path);
        }
        self.handle_queue()
    }

    // ── Queueing ────────────────────────────────────────

    fn initialize_queue(&mut self) {
        self.queue.clear();

        self.queue_if_exists("README.md");
        for launcher in platform::launchers() {
            self.queue_if_exists(launcher);
        }

        // macOS bundles at the root are scanned wholesale.
        if let Ok(entries) = std::fs::read_dir(self.files.root()) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_dir() && name.ends_with(".app") && !name.contains(".old") {
                    self.queue_dir(&name, &[""]);
                }
            }
        }

        for (dir, extensions) in DIRECTORIES {
            self.queue_dir(dir, extensions);
        }

        // Everything the catalog knows about must be visited, found or not.
        let known: Vec<String> = self
            .files
            .iter()
            .map(|file| file.local_filename_or_default().to_string())
            .collect();
        for filename in known {
            let key = util::strip_filename_version(&filename);
            if !self.queue.iter().any(|(unversioned, _)| *unversioned == key) {
                self.queue_path(&filename);
            }
        }
    }

    fn queue_dir(&mut self, dir: &str, extensions: &[&str]) {
        let root = self.files.prefix(dir);
        if !root.exists() {
            return;
        }
        let any_extension = extensions.contains(&"");
        let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
            !entry
                .file_name()
                .to_string_lossy()
                .starts_with('.')
        });
        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !any_extension {
                let Some(dot) = name.rfind('.') else {
                    continue;
                };
                if !extensions.contains(&&name[dot..]) {
                    continue;
                }
            }
            if let Ok(relative) = entry.path().strip_prefix(self.files.root()) {
                let path = relative.to_string_lossy().replace('\\', "/");
                self.queue(path, entry.path().to_path_buf());
            }
        }
    }

    fn queue_if_exists(&mut self, path: &str) {
        let file = self.files.prefix(path);
        if file.exists() {
            self.queue(path.to_string(), file);
        }
    }

    fn queue_path(&mut self, path: &str) {
        let file = self.files.prefix(path);
        self.queue(path.to_string(), file);
    }

    fn queue(&mut self, path: String, file: PathBuf) {
        let unversioned = util::strip_filename_version(&path);
        // .old files are backups left behind by launcher updates; they must
        // never surface as local-only entries.
        if unversioned.contains(".old") {
            return;
        }
        let candidate = Candidate {
            path,
            file,
            timestamp: 0,
            checksum: None,
        };
        match self
            .queue
            .iter_mut()
            .find(|(name, _)| *name == unversioned)
        {
            Some((_, list)) => {
                if !list.iter().any(|entry| entry.path == candidate.path) {
                    list.push(candidate);
                }
            }
            None => self.queue.push((unversioned, vec![candidate])),
        }
    }

    // ── Processing ──────────────────────────────────────

    fn handle_queue(&mut self) -> UpdaterResult<()> {
        self.total = self
            .queue
            .iter()
            .flat_map(|(_, list)| list.iter())
            .map(|candidate| file_size(&candidate.file))
            .sum();
        self.counter = 0;

        let queue = std::mem::take(&mut self.queue);
        for (unversioned, candidates) in queue {
            self.handle_group(&unversioned, candidates)?;
        }
        self.progress.done();

        let root = self.files.root().to_path_buf();
        self.cache
            .save(&self.files.prefix(".checksums"), |filename| {
                root.join(filename).exists()
            });
        Ok(())
    }

    fn handle_group(&mut self, unversioned: &str, mut candidates: Vec<Candidate>) -> UpdaterResult<()> {
        for candidate in &mut candidates {
            self.progress.add_item(&candidate.path);
            if candidate.file.exists() {
                match util::file_timestamp(&candidate.file) {
                    Ok(timestamp) => {
                        candidate.timestamp = timestamp;
                        match self.digest_cached(&candidate.path, &candidate.file, timestamp) {
                            Ok(checksum) => candidate.checksum = Some(checksum),
                            Err(err) => error!("Problem digesting {:?}: {err}", candidate.file),
                        }
                    }
                    Err(err) => error!("{err}"),
                }
            }
            self.counter += file_size(&candidate.file);
            self.progress.item_done(&candidate.path);
            self.progress.set_count(self.counter as usize, self.total as usize);
        }

        if candidates.len() == 1 {
            let only = candidates.remove(0);
            self.handle_candidate(only);
            return Ok(());
        }

        // Multiple versions of the same component exist side by side.
        let known = self
            .files
            .get(unversioned)
            .filter(|record| !record.is_obsolete())
            .map(|record| {
                (
                    record
                        .current
                        .as_ref()
                        .map(|version| version.checksum.clone()),
                    record.clone(),
                )
            });
        let winner = match known {
            None => {
                // Local-only or obsolete: keep the newest, offer to delete
                // the rest.
                candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                let winner = candidates.remove(0);
                let losers: Vec<PathBuf> =
                    candidates.into_iter().map(|candidate| candidate.file).collect();
                self.add_conflict(&winner.path, "", false, losers);
                winner
            }
            Some((current_checksum, record)) => {
                let mut up_to_date = Vec::new();
                let mut obsoletes = Vec::new();
                let mut modified = Vec::new();
                for candidate in candidates {
                    let checksum = candidate.checksum.as_deref();
                    if checksum.is_some() && checksum == current_checksum.as_deref() {
                        up_to_date.push(candidate);
                    } else if checksum.is_some_and(|sum| record.has_previous_version(sum)) {
                        obsoletes.push(candidate);
                    } else {
                        modified.push(candidate);
                    }
                }
                for list in [&mut up_to_date, &mut obsoletes, &mut modified] {
                    list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                }
                let winner = if !up_to_date.is_empty() {
                    pick_newest(&mut up_to_date)
                } else if !obsoletes.is_empty() {
                    pick_newest(&mut obsoletes)
                } else {
                    pick_newest(&mut modified)
                };
                if !modified.is_empty() {
                    self.add_conflict(&winner.path, "locally-modified", true, paths(modified));
                }
                if !obsoletes.is_empty() {
                    self.add_conflict(&winner.path, "obsolete", false, paths(obsoletes));
                }
                if !up_to_date.is_empty() {
                    self.add_conflict(&winner.path, "up-to-date", false, paths(up_to_date));
                }
                winner
            }
        };
        self.handle_candidate(winner);
        Ok(())
    }

    fn handle_candidate(&mut self, candidate: Candidate) {
        match candidate.checksum {
            Some(mut checksum) => {
                if self.files.get(&candidate.path).is_none() {
                    let mut record = FileRecord::new(
                        None,
                        candidate.path.clone(),
                        file_size(&candidate.file),
                        Some(checksum.clone()),
                        candidate.timestamp,
                        Status::LocalOnly,
                    );
                    record.local_filename = Some(candidate.path.clone());
                    record.local_checksum = Some(checksum);
                    record.local_timestamp = candidate.timestamp;
                    if can_execute(&candidate.file) || candidate.path.ends_with(".exe") {
                        record.executable = true;
                    }
                    guess_platform(&mut record);
                    self.files.add(record);
                    return;
                }

                // Remap a freshly computed digest onto the catalog's record
                // of it when they are legacy-equivalent.
                let equivalents = self.cache.equivalents(&checksum);
                if let Some(record) = self.files.get(&candidate.path) {
                    if !record.has_previous_version(&checksum) {
                        if let Some(equivalents) = &equivalents {
                            for equivalent in equivalents {
                                if record.has_previous_version(equivalent) {
                                    checksum = equivalent.clone();
                                    break;
                                }
                            }
                        }
                    } else if let (Some(current), Some(equivalents)) =
                        (&record.current, &equivalents)
                    {
                        if equivalents.contains(&current.checksum) {
                            checksum = current.checksum.clone();
                        }
                    }
                }
                if let Some(record) = self.files.get_mut(&candidate.path) {
                    record.set_local_version(&candidate.path, &checksum, candidate.timestamp);
                    if record.status() == Status::ObsoleteUninstalled {
                        record.set_status(Status::Obsolete);
                    }
                }
            }
            None => {
                // The file is gone (or unreadable).
                let Some(record) = self.files.get(&candidate.path) else {
                    return;
                };
                match record.status() {
                    Status::Obsolete | Status::ObsoleteModified => {
                        if let Some(record) = self.files.get_mut(&candidate.path) {
                            record.set_status(Status::ObsoleteUninstalled);
                        }
                    }
                    Status::Installed | Status::Modified | Status::Updateable => {
                        if let Some(record) = self.files.get_mut(&candidate.path) {
                            record.set_status(Status::NotInstalled);
                        }
                    }
                    Status::LocalOnly => {
                        self.files.remove(&candidate.path);
                    }
                    Status::New | Status::NotInstalled | Status::ObsoleteUninstalled => {}
                }
            }
        }
    }

    fn digest_cached(&mut self, path: &str, file: &Path, timestamp: u64) -> UpdaterResult<String> {
        let cached = self
            .cache
            .get(path)
            .filter(|version| version.timestamp == timestamp)
            .map(|version| version.checksum.clone());
        let checksum = match cached {
            Some(checksum) => checksum,
            None => {
                let checksum = hasher::digest(path, file)?;
                self.cache.insert(path, &checksum, timestamp);
                checksum
            }
        };
        if !self.cache.has_equivalents(&checksum) {
            if let Some(legacy) = hasher::legacy_digests(path, file)? {
                self.cache.set_equivalents(&checksum, &legacy, timestamp);
            }
        }
        Ok(checksum)
    }

    fn add_conflict(
        &mut self,
        filename: &str,
        adjective: &str,
        critical: bool,
        to_delete: Vec<PathBuf>,
    ) {
        let adjective = if adjective.is_empty() {
            String::new()
        } else {
            format!("{adjective} ")
        };
        let listing = util::join(
            ", ",
            to_delete.iter().map(|path| path.display().to_string()),
        );
        let message =
            format!("Multiple {adjective}versions of {filename} exist: {listing}");
        self.files.conflicts.push(Conflict {
            severity: if critical {
                Severity::CriticalError
            } else {
                Severity::Error
            },
            filename: Some(filename.to_string()),
            message,
            resolutions: vec![
                Resolution {
                    description: "Ignore for now".to_string(),
                    effect: ResolutionEffect::Ignore {
                        filename: filename.to_string(),
                    },
                },
                Resolution {
                    description: "Delete!".to_string(),
                    effect: ResolutionEffect::DeleteFiles {
                        filename: filename.to_string(),
                        paths: to_delete,
                    },
                },
            ],
        });
    }
}

/// The newest candidate of a (descending-sorted) category, except that a
/// plain unversioned file yields to a versioned sibling, which is the
/// canonical on-site form.
fn pick_newest(list: &mut Vec<Candidate>) -> Candidate {
    let mut index = 0;
    if list.len() > 1 && list[0].path == util::strip_filename_version(&list[0].path) {
        index = 1;
    }
    list.remove(index)
}

fn paths(list: Vec<Candidate>) -> Vec<PathBuf> {
    list.into_iter().map(|candidate| candidate.file).collect()
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0)
}

#[cfg(unix)]
fn can_execute(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn can_execute(_path: &Path) -> bool {
    false
}

/// Infer platform tags from the path: launchers map through the launcher
/// table, and files under `jars/<platform>/` or `lib/<platform>/` inherit
/// the directory's tag.
fn guess_platform(record: &mut FileRecord) {
    if record.executable {
        if let Some(tag) = platform::platform_for_launcher(&record.filename) {
            record.add_platform(tag);
        }
        return;
    }
    if let Some(tag) = platform::platform_of_path(&record.filename) {
        let tag = tag.to_string();
        record.add_platform(&tag);
    }
}

/// One-call convenience: load catalogs already read into `files`, then scan.
pub fn checksum_all(
    files: &mut FilesCollection,
    progress: &mut dyn Progress,
) -> UpdaterResult<()> {
    Checksummer::new(files, progress).update_from_local()
}

/// Files of one update site, re-checksummed after its catalog was re-read.
pub fn checksum_site(
    files: &mut FilesCollection,
    progress: &mut dyn Progress,
    site: &str,
) -> UpdaterResult<()> {
    let mut paths: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for record in files.for_update_site(site, false) {
        let path = record.local_filename_or_default().to_string();
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }
    Checksummer::new(files, progress).update_some(&paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::NullProgress;

    fn write(root: &Path, path: &str, contents: &[u8]) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    #[test]
    fn untracked_files_become_local_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "macros/hello.ijm", b"print('hi')\n");
        write(dir.path(), "macros/.hidden.ijm", b"nope\n");
        write(dir.path(), "macros/backup.old.ijm", b"nope\n");

        let mut files = FilesCollection::new(dir.path());
        checksum_all(&mut files, &mut NullProgress).unwrap();

        let record = files.get("macros/hello.ijm").expect("tracked");
        assert_eq!(record.status(), Status::LocalOnly);
        assert!(record.local_checksum.is_some());
        assert!(files.get("macros/.hidden.ijm").is_none());
        assert!(files.get("macros/backup.old.ijm").is_none());
    }

    #[test]
    fn unknown_extensions_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "macros/notes.pdf", b"%PDF");

        let mut files = FilesCollection::new(dir.path());
        checksum_all(&mut files, &mut NullProgress).unwrap();
        assert!(files.get("macros/notes.pdf").is_none());
    }

    #[test]
    fn vanished_known_file_is_demoted() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = FilesCollection::new(dir.path());
        let mut record = FileRecord::new(
            Some("Spectra".into()),
            "macros/gone.ijm",
            4,
            Some("aaaa".into()),
            20240101000000,
            Status::NotInstalled,
        );
        record.set_local_version("macros/gone.ijm", "aaaa", 20240101000000);
        assert_eq!(record.status(), Status::Installed);
        files.add(record);

        checksum_all(&mut files, &mut NullProgress).unwrap();
        assert_eq!(
            files.get("macros/gone.ijm").unwrap().status(),
            Status::NotInstalled
        );
    }

    #[test]
    fn multiple_versions_pick_newest_and_raise_conflict() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "macros/dup.ijm", b"old\n");
        write(dir.path(), "macros/dup-2.ijm", b"new\n");

        let mut files = FilesCollection::new(dir.path());
        checksum_all(&mut files, &mut NullProgress).unwrap();

        assert!(files.get("macros/dup.ijm").is_some());
        assert_eq!(files.conflicts.len(), 1);
        let conflict = &files.conflicts[0];
        assert!(conflict.message.contains("Multiple"));
        assert_eq!(conflict.resolutions.len(), 2);
    }

    #[test]
    fn cache_is_reused_when_mtime_matches() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "macros/hello.ijm", b"print('hi')\n");

        let mut files = FilesCollection::new(dir.path());
        checksum_all(&mut files, &mut NullProgress).unwrap();
        let first = files
            .get("macros/hello.ijm")
            .unwrap()
            .local_checksum
            .clone();

        // Second scan with a fresh collection reads the cache file.
        let mut files = FilesCollection::new(dir.path());
        checksum_all(&mut files, &mut NullProgress).unwrap();
        let second = files
            .get("macros/hello.ijm")
            .unwrap()
            .local_checksum
            .clone();
        assert_eq!(first, second);
        assert!(dir.path().join(".checksums").exists());
    }

    #[test]
    fn launchers_are_recognized_at_the_root() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "spectra-linux-x64", b"\x7fELF");

        let mut files = FilesCollection::new(dir.path());
        checksum_all(&mut files, &mut NullProgress).unwrap();
        let record = files.get("spectra-linux-x64").expect("launcher tracked");
        assert_eq!(record.status(), Status::LocalOnly);
    }
}
