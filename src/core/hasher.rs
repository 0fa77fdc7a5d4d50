use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};
use zip::ZipArchive;

use crate::core::error::{UpdaterError, UpdaterResult};

/// The updater's own bundle predates every digest filter, so catalogs record
/// it with the raw archive digest. It must keep hashing that way forever.
pub const UPDATER_JAR: &str = "plugins/Spectra_Updater.jar";

/// Which volatile archive entries are normalized away before hashing.
///
/// Build tooling rewrites `.properties` date comments and manifest metadata
/// on every rebuild; hashing them verbatim would flag functionally identical
/// archives as modified. Catalogs written by earlier updater generations used
/// weaker filter combinations, so those variants must stay reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveFilter {
    pub properties_specially: bool,
    pub manifests_specially: bool,
    pub keep_only_main_class: bool,
}

impl ArchiveFilter {
    pub const CURRENT: ArchiveFilter = ArchiveFilter {
        properties_specially: true,
        manifests_specially: true,
        keep_only_main_class: true,
    };

    /// Earlier-era filter combinations, newest first.
    pub const LEGACY: [ArchiveFilter; 3] = [
        ArchiveFilter {
            properties_specially: true,
            manifests_specially: true,
            keep_only_main_class: false,
        },
        ArchiveFilter {
            properties_specially: true,
            manifests_specially: false,
            keep_only_main_class: false,
        },
        ArchiveFilter::RAW,
    ];

    /// No filtering at all: the original archive-digest scheme.
    pub const RAW: ArchiveFilter = ArchiveFilter {
        properties_specially: false,
        manifests_specially: false,
        keep_only_main_class: false,
    };
}

/// Digest of a file as recorded in the catalog.
///
/// Non-archive files hash as SHA-1 over the ASCII path bytes followed by the
/// raw contents, so renaming a file changes its identity. Archives hash their
/// entries in ASCII-sorted order with volatile entries filtered.
pub fn digest(path: &str, file: &Path) -> UpdaterResult<String> {
    if path.ends_with(".jar") {
        let filter = if path == UPDATER_JAR {
            ArchiveFilter::RAW
        } else {
            ArchiveFilter::CURRENT
        };
        return archive_digest(file, filter);
    }
    let mut hasher = Sha1::new();
    hasher.update(path.as_bytes());
    let mut input = File::open(file).map_err(UpdaterError::io(file))?;
    let mut buffer = [0u8; 65536];
    loop {
        let read = input.read(&mut buffer).map_err(UpdaterError::io(file))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digests an earlier updater generation would have recorded for this file,
/// newest first. `None` for non-archives, which only ever had one scheme.
pub fn legacy_digests(path: &str, file: &Path) -> UpdaterResult<Option<Vec<String>>> {
    if !path.ends_with(".jar") {
        return Ok(None);
    }
    let mut result = Vec::with_capacity(ArchiveFilter::LEGACY.len());
    for filter in ArchiveFilter::LEGACY {
        result.push(archive_digest(file, filter)?);
    }
    Ok(Some(result))
}

/// All digests a local file may legitimately carry: current first, then the
/// legacy variants for archives.
pub fn all_digests(path: &str, file: &Path) -> UpdaterResult<Vec<String>> {
    let mut result = vec![digest(path, file)?];
    if let Some(legacy) = legacy_digests(path, file)? {
        result.extend(legacy);
    }
    Ok(result)
}

pub fn archive_digest(file: &Path, filter: ArchiveFilter) -> UpdaterResult<String> {
    let mut hasher = Sha1::new();
    let input = File::open(file).map_err(UpdaterError::io(file))?;
    let mut archive = ZipArchive::new(input)?;

    let mut names: Vec<String> = archive.file_names().map(String::from).collect();
    names.sort();

    for name in names {
        hasher.update(name.as_bytes());
        let mut entry = archive.by_name(&name)?;
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(UpdaterError::io(file))?;

        if filter.properties_specially && name.ends_with(".properties") {
            contents = strip_hashed_lines(&contents);
        } else if filter.manifests_specially && name == "META-INF/MANIFEST.MF" {
            contents = filter_manifest(&contents, filter.keep_only_main_class);
        }
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Drop lines starting with `#`, the build-date comments of `.properties`.
fn strip_hashed_lines(contents: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(contents.len());
    for line in contents.split_inclusive(|byte| *byte == b'\n') {
        if !line.starts_with(b"#") {
            result.extend_from_slice(line);
        }
    }
    result
}

/// Reduce a manifest to its stable part.
///
/// Continuation lines (leading space) are folded before filtering. The output
/// is the normalized form `Manifest-Version: 1.0` plus, when requested and
/// present, the `Main-Class` attribute, CRLF-terminated with a trailing blank
/// line.
fn filter_manifest(contents: &[u8], keep_only_main_class: bool) -> Vec<u8> {
    let text = String::from_utf8_lossy(contents);
    let mut attributes: Vec<(String, String)> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            // Attributes after the first blank line are per-entry sections,
            // which are volatile; stop folding.
            break;
        }
        if let Some(continuation) = line.strip_prefix(' ') {
            if let Some(last) = attributes.last_mut() {
                last.1.push_str(continuation);
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            attributes.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let mut result = Vec::new();
    result.extend_from_slice(b"Manifest-Version: 1.0\r\n");
    if keep_only_main_class {
        if let Some((_, main_class)) = attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("Main-Class"))
        {
            result.extend_from_slice(format!("Main-Class: {main_class}\r\n").as_bytes());
        }
    }
    result.extend_from_slice(b"\r\n");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_jar(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (entry_name, contents) in entries {
            writer
                .start_file(entry_name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn plain_file_digest_covers_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("hello.ijm");
        std::fs::write(&a, b"print('hello')\n").unwrap();
        let b = dir.path().join("other.ijm");
        std::fs::write(&b, b"print('hello')\n").unwrap();

        let digest_a = digest("macros/hello.ijm", &a).unwrap();
        let digest_b = digest("macros/other.ijm", &b).unwrap();
        assert_ne!(digest_a, digest_b);
        assert_eq!(digest_a, digest("macros/hello.ijm", &b).unwrap());
    }

    #[test]
    fn properties_comments_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_jar(
            dir.path(),
            "one.jar",
            &[
                ("org/example/Main.class", b"\xca\xfe\xba\xbe fake"),
                ("build.properties", b"#Built on 2024-01-01\nversion=1\n"),
            ],
        );
        let two = write_jar(
            dir.path(),
            "two.jar",
            &[
                ("org/example/Main.class", b"\xca\xfe\xba\xbe fake"),
                ("build.properties", b"#Built on 2025-06-30\nversion=1\n"),
            ],
        );
        assert_eq!(
            digest("jars/one.jar", &one).unwrap(),
            digest("jars/two.jar", &two).unwrap()
        );
        // The raw legacy mode still sees the difference.
        assert_ne!(
            archive_digest(&one, ArchiveFilter::RAW).unwrap(),
            archive_digest(&two, ArchiveFilter::RAW).unwrap()
        );
    }

    #[test]
    fn manifest_attributes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_jar(
            dir.path(),
            "one.jar",
            &[(
                "META-INF/MANIFEST.MF",
                b"Manifest-Version: 1.0\r\nBuilt-By: alice\r\nMain-Class: org.example.Main\r\n\r\n"
                    .as_slice(),
            )],
        );
        let two = write_jar(
            dir.path(),
            "two.jar",
            &[(
                "META-INF/MANIFEST.MF",
                b"Manifest-Version: 1.0\r\nBuilt-By: bob\r\nMain-Class: org.example.Main\r\n\r\n"
                    .as_slice(),
            )],
        );
        assert_eq!(
            digest("jars/one.jar", &one).unwrap(),
            digest("jars/two.jar", &two).unwrap()
        );
    }

    #[test]
    fn main_class_changes_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_jar(
            dir.path(),
            "one.jar",
            &[(
                "META-INF/MANIFEST.MF",
                b"Manifest-Version: 1.0\r\nMain-Class: org.example.Main\r\n\r\n".as_slice(),
            )],
        );
        let two = write_jar(
            dir.path(),
            "two.jar",
            &[(
                "META-INF/MANIFEST.MF",
                b"Manifest-Version: 1.0\r\nMain-Class: org.example.Other\r\n\r\n".as_slice(),
            )],
        );
        assert_ne!(
            digest("jars/one.jar", &one).unwrap(),
            digest("jars/two.jar", &two).unwrap()
        );
        // Without keep_only_main_class the attribute is dropped entirely.
        assert_eq!(
            archive_digest(&one, ArchiveFilter::LEGACY[0]).unwrap(),
            archive_digest(&two, ArchiveFilter::LEGACY[0]).unwrap()
        );
    }

    #[test]
    fn legacy_digests_cover_three_eras() {
        let dir = tempfile::tempdir().unwrap();
        let jar = write_jar(dir.path(), "lib.jar", &[("a.txt", b"a".as_slice())]);
        let legacy = legacy_digests("jars/lib.jar", &jar).unwrap().unwrap();
        assert_eq!(legacy.len(), 3);
        assert!(legacy_digests("macros/hello.ijm", &jar).unwrap().is_none());
    }

    #[test]
    fn updater_bundle_uses_raw_mode() {
        let dir = tempfile::tempdir().unwrap();
        let jar = write_jar(
            dir.path(),
            "updater.jar",
            &[("build.properties", b"#date\nx=1\n".as_slice())],
        );
        assert_eq!(
            digest(UPDATER_JAR, &jar).unwrap(),
            archive_digest(&jar, ArchiveFilter::RAW).unwrap()
        );
    }
}
