mod classfile;

pub use classfile::referenced_classes;

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::FileRecord;
use crate::core::util;

/// Packages the host runtime provides; references into them are never
/// dependencies on installed archives.
const RUNTIME_PREFIXES: &[&str] = &["java.", "javax.", "jdk.", "sun.", "com.sun.", "org.w3c.", "org.xml."];

/// class name (dotted) → archives that provide it, relative to the root.
pub struct ClassIndex {
    map: HashMap<String, Vec<String>>,
}

impl ClassIndex {
    /// Index every archive under `jars/` and `plugins/`.
    pub fn build(root: &Path) -> UpdaterResult<Self> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for dir in ["jars", "plugins"] {
            let base = root.join(dir);
            if !base.exists() {
                continue;
            }
            for entry in WalkDir::new(&base).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.ends_with(".jar") {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(root) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                if let Err(error) = index_archive(&mut map, entry.path(), &relative) {
                    warn!("Could not index {relative}: {error}");
                }
            }
        }
        Ok(Self { map })
    }

    pub fn archives_for(&self, class_name: &str) -> Option<&[String]> {
        self.map.get(class_name).map(Vec::as_slice)
    }
}

fn index_archive(
    map: &mut HashMap<String, Vec<String>>,
    path: &Path,
    relative: &str,
) -> UpdaterResult<()> {
    let file = File::open(path).map_err(UpdaterError::io(path))?;
    let mut archive = ZipArchive::new(file)?;
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let name = entry.name();
        if let Some(class_path) = name.strip_suffix(".class") {
            let class_name = class_path.replace('/', ".");
            let archives = map.entry(class_name).or_default();
            if !archives.iter().any(|existing| existing == relative) {
                archives.push(relative.to_string());
            }
        }
    }
    Ok(())
}

/// Derives the archive-level dependency set of a bundle by resolving every
/// class its members reference through the installed-archive index.
pub struct DependencyAnalyzer {
    index: ClassIndex,
}

impl DependencyAnalyzer {
    pub fn new(root: &Path) -> UpdaterResult<Self> {
        Ok(Self {
            index: ClassIndex::build(root)?,
        })
    }

    /// The sorted set of archive filenames `record` depends on; `None` for
    /// non-archives.
    pub fn dependencies(
        &self,
        root: &Path,
        record: &FileRecord,
    ) -> UpdaterResult<Option<BTreeSet<String>>> {
        let path = record.filename.as_str();
        if !path.ends_with(".jar") {
            return Ok(None);
        }
        let file = root.join(record.local_filename_or_default());
        if !file.exists() {
            return Ok(None);
        }

        let mut result = BTreeSet::new();
        let archive_file = File::open(&file).map_err(UpdaterError::io(&file))?;
        let mut archive = ZipArchive::new(archive_file)?;
        let entry_names: Vec<String> = archive.file_names().map(String::from).collect();

        'entries: for entry_name in entry_names {
            if !entry_name.ends_with(".class") || entry_name.ends_with("module-info.class") {
                continue;
            }
            let mut code = Vec::new();
            archive
                .by_name(&entry_name)?
                .read_to_end(&mut code)
                .map_err(UpdaterError::io(&file))?;
            let class_names = match referenced_classes(&code) {
                Ok(names) => names,
                Err(error) => {
                    return Err(UpdaterError::Other(format!(
                        "Could not analyze class '{entry_name}' from '{path}': {error}"
                    )))
                }
            };

            for class_name in class_names {
                if RUNTIME_PREFIXES
                    .iter()
                    .any(|prefix| class_name.starts_with(prefix))
                {
                    continue;
                }
                let Some(providers) = self.index.archives_for(&class_name) else {
                    continue;
                };

                // Prefer archives the record already declares.
                let mut ordered: Vec<String> = record
                    .dependencies
                    .iter()
                    .filter(|dep| root.join(&dep.filename).exists())
                    .map(|dep| dep.filename.clone())
                    .collect();
                for provider in providers {
                    if !ordered.contains(provider) {
                        ordered.push(provider.clone());
                    }
                }

                let mut candidates = Vec::new();
                for candidate in &ordered {
                    if exclude(path, candidate) {
                        continue;
                    }
                    if record.has_dependency(candidate) {
                        // A declared dependency covers this reference; the
                        // rest of this entry's references resolve the same.
                        continue 'entries;
                    }
                    candidates.push(candidate.clone());
                }
                if candidates.len() > 1 {
                    warn!(
                        "class {class_name}, referenced in {path}, is in more than one archive; \
                         adding all as dependency"
                    );
                }
                for candidate in candidates {
                    debug!("adding dep {candidate} for {path} because of class {class_name}");
                    result.insert(candidate);
                }
            }
        }
        Ok(Some(result))
    }
}

fn same_artifact(unversioned_base: &str, other: &str) -> bool {
    if other == format!("{unversioned_base}.jar") {
        return true;
    }
    util::strip_filename_version(other) == format!("{unversioned_base}.jar")
}

/// Dependencies we know better than the bytecode about: self references,
/// archives that declare themselves dependency-free, and known circular
/// pairs where one direction is forced.
fn exclude(archive: &str, dependency: &str) -> bool {
    archive == dependency
        || same_artifact("jars/javac", dependency)
        || same_artifact("jars/vecmath", dependency)
        || same_artifact("jars/slf4j-api", archive) // the logging API has no deps
        || (same_artifact("jars/jython", archive)
            && same_artifact("jars/jruby-complete", dependency))
        || (same_artifact("jars/jruby-complete", archive)
            && same_artifact("jars/jython", dependency))
        || (same_artifact("jars/bsh", archive) && same_artifact("jars/testng", dependency))
        || (same_artifact("jars/testng", archive) && same_artifact("jars/guice", dependency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Status;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn fake_class(references: &[&str]) -> Vec<u8> {
        // mirrors the constant pool layout exercised in classfile tests
        let mut pool: Vec<u8> = Vec::new();
        let mut count: u16 = 1;
        for name in references {
            let internal = name.replace('.', "/");
            pool.push(1); // Utf8
            pool.extend_from_slice(&(internal.len() as u16).to_be_bytes());
            pool.extend_from_slice(internal.as_bytes());
            let utf8_index = count;
            count += 1;
            pool.push(7); // Class
            pool.extend_from_slice(&utf8_index.to_be_bytes());
            count += 1;
        }
        let mut class = Vec::new();
        class.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        class.extend_from_slice(&0u16.to_be_bytes());
        class.extend_from_slice(&52u16.to_be_bytes());
        class.extend_from_slice(&count.to_be_bytes());
        class.extend_from_slice(&pool);
        class
    }

    fn write_jar(root: &Path, relative: &str, entries: &[(&str, Vec<u8>)]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (name, contents) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn resolves_references_to_providing_archives() {
        let dir = tempfile::tempdir().unwrap();
        write_jar(
            dir.path(),
            "jars/helper.jar",
            &[("org/example/Helper.class", fake_class(&[]))],
        );
        write_jar(
            dir.path(),
            "jars/plugin.jar",
            &[(
                "org/example/Plugin.class",
                fake_class(&["org.example.Helper", "java.lang.Object"]),
            )],
        );

        let analyzer = DependencyAnalyzer::new(dir.path()).unwrap();
        let record = FileRecord::new(
            Some("Spectra".into()),
            "jars/plugin.jar",
            0,
            Some("aaaa".into()),
            20240101000000,
            Status::Installed,
        );
        let deps = analyzer.dependencies(dir.path(), &record).unwrap().unwrap();
        assert!(deps.contains("jars/helper.jar"));
        // runtime classes never become dependencies
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn non_archives_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = DependencyAnalyzer::new(dir.path()).unwrap();
        let record = FileRecord::new(
            Some("Spectra".into()),
            "macros/hello.ijm",
            0,
            Some("aaaa".into()),
            20240101000000,
            Status::Installed,
        );
        assert!(analyzer.dependencies(dir.path(), &record).unwrap().is_none());
    }

    #[test]
    fn exclusion_table_is_honored() {
        assert!(exclude("jars/plugin.jar", "jars/plugin.jar"));
        assert!(exclude("jars/slf4j-api-2.0.9.jar", "jars/anything.jar"));
        assert!(exclude("jars/jython-2.7.3.jar", "jars/jruby-complete.jar"));
        assert!(!exclude("jars/plugin.jar", "jars/helper.jar"));
    }
}
