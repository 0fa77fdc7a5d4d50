use std::path::PathBuf;

use tracing::warn;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::{Action, FilesCollection, Status};
use crate::core::util;

/// `Error` conflicts inform; the engine may proceed while they stand.
/// `CriticalError` conflicts block until a resolution is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    CriticalError,
}

#[derive(Debug, Clone)]
pub struct Conflict {
    pub severity: Severity,
    pub filename: Option<String>,
    pub message: String,
    pub resolutions: Vec<Resolution>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.filename {
            Some(filename) => write!(f, "{filename}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A way out of a conflict: a human description plus the effect to apply.
///
/// Effects are data, not closures: `FilesCollection::apply_resolution`
/// executes them, which keeps conflicts cloneable, printable and testable.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub description: String,
    pub effect: ResolutionEffect,
}

#[derive(Debug, Clone)]
pub enum ResolutionEffect {
    /// Leave everything untouched.
    KeepAsIs,
    /// Dismiss a scanner conflict recorded on the collection.
    Ignore { filename: String },
    /// Delete stray files (multi-version losers).
    DeleteFiles {
        filename: String,
        paths: Vec<PathBuf>,
    },
    /// Stage a dependency for install/update.
    Install { filename: String },
    /// Revert a staged action to the status quo.
    KeepLocal { filename: String },
    /// Stage a file for uninstall.
    Uninstall { filename: String },
    /// Drop a dependency edge from its dependees.
    BreakDependency {
        dependency: String,
        dependees: Vec<String>,
    },
    /// Drop every dependency of an obsolete file.
    RemoveDependencies { filename: String },
    /// Redo digest and timestamp of a file that changed under us.
    Rechecksum { filename: String },
}

/// True while a conflict in the list blocks progress.
pub fn needs_feedback(conflicts: &[Conflict]) -> bool {
    conflicts
        .iter()
        .any(|conflict| conflict.severity == Severity::CriticalError)
}

pub fn apply_resolution(
    files: &mut FilesCollection,
    effect: &ResolutionEffect,
) -> UpdaterResult<()> {
    match effect {
        ResolutionEffect::KeepAsIs => Ok(()),
        ResolutionEffect::Ignore { filename } => {
            remove_recorded_conflict(files, filename);
            Ok(())
        }
        ResolutionEffect::DeleteFiles { filename, paths } => {
            for path in paths {
                if let Err(error) = std::fs::remove_file(path) {
                    warn!("Could not delete {path:?}: {error}");
                    // Stage the deletion for the next move-into-place pass.
                    if let Ok(relative) = path.strip_prefix(files.root()) {
                        let relative = relative.to_string_lossy().replace('\\', "/");
                        util::touch(&files.prefix_update(&relative))?;
                    }
                }
            }
            remove_recorded_conflict(files, filename);
            Ok(())
        }
        ResolutionEffect::Install { filename } => {
            files.set_first_valid_action(filename, &[Action::Update, Action::Install])?;
            Ok(())
        }
        ResolutionEffect::KeepLocal { filename } => {
            if let Some(record) = files.get_mut(filename) {
                record.set_no_action();
            }
            Ok(())
        }
        ResolutionEffect::Uninstall { filename } => files.stage_for_uninstall(filename),
        ResolutionEffect::BreakDependency {
            dependency,
            dependees,
        } => {
            for dependee in dependees {
                if let Some(record) = files.get_mut(dependee) {
                    record.remove_dependency(dependency);
                }
            }
            Ok(())
        }
        ResolutionEffect::RemoveDependencies { filename } => {
            if let Some(record) = files.get_mut(filename) {
                record.dependencies.clear();
            }
            Ok(())
        }
        ResolutionEffect::Rechecksum { filename } => {
            let (path, local_name) = match files.get(filename) {
                Some(record) => (
                    files.prefix(record.local_filename_or_default()),
                    record.local_filename_or_default().to_string(),
                ),
                None => return Err(UpdaterError::UnknownFile(filename.to_string())),
            };
            let timestamp = util::file_timestamp(&path)?;
            let checksum = crate::core::hasher::digest(&local_name, &path)?;
            let filesize = std::fs::metadata(&path)
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if let Some(record) = files.get_mut(filename) {
                record.set_local_version(&local_name, &checksum, timestamp);
                record.filesize = filesize;
            }
            Ok(())
        }
    }
}

fn remove_recorded_conflict(files: &mut FilesCollection, filename: &str) {
    if let Some(position) = files
        .conflicts
        .iter()
        .position(|conflict| conflict.filename.as_deref() == Some(filename))
    {
        files.conflicts.remove(position);
    }
}

/// Derives the conflicts standing between the staged actions and a safe
/// install or upload. Scanner-recorded conflicts are included verbatim.
pub struct Conflicts<'a> {
    files: &'a FilesCollection,
}

impl<'a> Conflicts<'a> {
    pub fn new(files: &'a FilesCollection) -> Self {
        Self { files }
    }

    pub fn list(&self, for_upload: bool) -> Vec<Conflict> {
        let mut result = self.files.conflicts.clone();
        if for_upload {
            self.conflicts_for_upload(&mut result);
        } else {
            self.conflicts_for_install(&mut result);
        }
        result.sort_by(|a, b| b.severity.cmp(&a.severity));
        result
    }

    // ── Install / update pass ───────────────────────────

    fn conflicts_for_install(&self, result: &mut Vec<Conflict>) {
        let staged: Vec<String> = self
            .files
            .to_install_or_update()
            .map(|file| file.filename_stripped())
            .collect();

        // Every transitive non-overriding dependency must end up-to-date.
        for (dependency, dependees) in self.files.dependencees(&staged, false) {
            let Some(record) = self.files.get(&dependency) else {
                continue;
            };
            if record.will_be_up_to_date() {
                continue;
            }
            let listing = util::join(", ", dependees.iter());
            result.push(Conflict {
                severity: Severity::CriticalError,
                filename: Some(dependency.clone()),
                message: format!(
                    "Needed by {listing}, but {dependency} is not (or no longer) up-to-date"
                ),
                resolutions: vec![
                    Resolution {
                        description: format!("Install/update {dependency}"),
                        effect: ResolutionEffect::Install {
                            filename: dependency.clone(),
                        },
                    },
                    Resolution {
                        description: "Break the dependency".to_string(),
                        effect: ResolutionEffect::BreakDependency {
                            dependency: dependency.clone(),
                            dependees,
                        },
                    },
                ],
            });
        }

        for file in self.files.to_install_or_update() {
            if !file.is_locally_modified() {
                continue;
            }
            let filename = file.filename_stripped();
            result.push(Conflict {
                severity: Severity::Error,
                filename: Some(filename.clone()),
                message: format!("Local changes of {filename} would be overwritten"),
                resolutions: vec![
                    Resolution {
                        description: "Keep the local version".to_string(),
                        effect: ResolutionEffect::KeepLocal {
                            filename: filename.clone(),
                        },
                    },
                    Resolution {
                        description: "Overwrite it".to_string(),
                        effect: ResolutionEffect::KeepAsIs,
                    },
                ],
            });
        }

        for file in self.files.iter() {
            if file.status() != Status::Obsolete || file.action() == Action::Uninstall {
                continue;
            }
            let filename = file.filename_stripped();
            result.push(Conflict {
                severity: Severity::Error,
                filename: Some(filename.clone()),
                message: format!("{filename} is obsolete, but still installed"),
                resolutions: vec![
                    Resolution {
                        description: "Uninstall it".to_string(),
                        effect: ResolutionEffect::Uninstall {
                            filename: filename.clone(),
                        },
                    },
                    Resolution {
                        description: "Do not update".to_string(),
                        effect: ResolutionEffect::KeepAsIs,
                    },
                ],
            });
        }
    }

    // ── Upload pass ─────────────────────────────────────

    fn conflicts_for_upload(&self, result: &mut Vec<Conflict>) {
        for site in self.files.site_names_to_upload() {
            if let Some(cycle) = self.files.find_dependency_cycle(Some(&site)) {
                result.push(Conflict {
                    severity: Severity::CriticalError,
                    filename: None,
                    message: format!("Circular dependency detected: {cycle}"),
                    resolutions: Vec::new(),
                });
            }
        }

        // No staged upload may depend on a file scheduled for removal.
        for file in self.files.to_upload(None) {
            for dependency in &file.dependencies {
                let Some(other) = self.files.get(&dependency.filename) else {
                    continue;
                };
                if other.action() != Action::Remove {
                    continue;
                }
                let dependency = other.filename_stripped();
                result.push(Conflict {
                    severity: Severity::CriticalError,
                    filename: Some(file.filename_stripped()),
                    message: format!(
                        "Depends on {dependency} which is about to be removed."
                    ),
                    resolutions: vec![Resolution {
                        description: "Break the dependency".to_string(),
                        effect: ResolutionEffect::BreakDependency {
                            dependency,
                            dependees: vec![file.filename_stripped()],
                        },
                    }],
                });
            }
        }

        // The payload must still be what the scanner digested.
        for file in self.files.to_upload(None) {
            let local_name = file.local_filename_or_default();
            let path = self.files.prefix(local_name);
            let recorded = if file.status() == Status::LocalOnly {
                file.current
                    .as_ref()
                    .map(|version| version.timestamp)
                    .unwrap_or(file.local_timestamp)
            } else {
                file.local_timestamp
            };
            let actual = util::file_timestamp(&path).unwrap_or(0);
            if recorded != actual {
                let filename = file.filename_stripped();
                result.push(Conflict {
                    severity: Severity::CriticalError,
                    filename: Some(filename.clone()),
                    message: format!(
                        "{local_name} changed since being checksummed (was {recorded}, is {actual})"
                    ),
                    resolutions: vec![Resolution {
                        description: "Re-checksum it".to_string(),
                        effect: ResolutionEffect::Rechecksum { filename },
                    }],
                });
            }
        }

        // Obsolete records must not drag dependency edges along.
        for file in self.files.iter() {
            if !file.is_obsolete()
                || file.dependencies.is_empty()
                || file.action() == Action::Upload
            {
                continue;
            }
            let filename = file.filename_stripped();
            result.push(Conflict {
                severity: Severity::Error,
                filename: Some(filename.clone()),
                message: format!(
                    "Obsolete file {filename} has dependencies: {}",
                    util::join(", ", file.dependencies.iter())
                ),
                resolutions: vec![Resolution {
                    description: "Remove the dependencies".to_string(),
                    effect: ResolutionEffect::RemoveDependencies { filename },
                }],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Dependency, FileRecord};

    fn collection() -> FilesCollection {
        FilesCollection::new(std::env::temp_dir().join("spectra-conflicts-test"))
    }

    fn remote_file(name: &str, checksum: &str) -> FileRecord {
        FileRecord::new(
            Some("Spectra".into()),
            name,
            10,
            Some(checksum.into()),
            20240101000000,
            Status::NotInstalled,
        )
    }

    #[test]
    fn unstaged_dependency_blocks_install() {
        let mut files = collection();
        let mut top = remote_file("jars/top.jar", "aaaa");
        top.add_dependency(Dependency::new("jars/lib.jar", 0, false));
        files.add(top);
        files.add(remote_file("jars/lib.jar", "bbbb"));
        files.set_action("jars/top.jar", Action::Install).unwrap();

        let conflicts = Conflicts::new(&files).list(false);
        assert!(needs_feedback(&conflicts));
        assert_eq!(conflicts[0].filename.as_deref(), Some("jars/lib.jar"));

        // Applying the install resolution clears it.
        let effect = conflicts[0].resolutions[0].effect.clone();
        apply_resolution(&mut files, &effect).unwrap();
        let conflicts = Conflicts::new(&files).list(false);
        assert!(!needs_feedback(&conflicts));
    }

    #[test]
    fn staged_dependency_is_no_conflict() {
        let mut files = collection();
        let mut top = remote_file("jars/top.jar", "aaaa");
        top.add_dependency(Dependency::new("jars/lib.jar", 0, false));
        files.add(top);
        files.add(remote_file("jars/lib.jar", "bbbb"));
        files.set_action("jars/top.jar", Action::Install).unwrap();
        files.set_action("jars/lib.jar", Action::Install).unwrap();

        let conflicts = Conflicts::new(&files).list(false);
        assert!(!needs_feedback(&conflicts));
    }

    #[test]
    fn modified_file_staged_for_update_warns() {
        let mut files = collection();
        let mut record = remote_file("macros/hello.ijm", "aaaa");
        record.set_local_version("macros/hello.ijm", "cccc", 20240101000000);
        files.add(record);
        files.stage_for_update("macros/hello.ijm", true).unwrap();

        let conflicts = Conflicts::new(&files).list(false);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Error);
        assert!(!needs_feedback(&conflicts));
        assert!(conflicts[0].message.contains("Local changes"));
    }

    #[test]
    fn upload_depending_on_removal_is_critical() {
        let mut files = collection();
        let mut keeper = remote_file("jars/keeper.jar", "aaaa");
        keeper.set_local_version("jars/keeper.jar", "eeee", 20240101000000);
        keeper.add_dependency(Dependency::new("jars/goner.jar", 0, false));
        files.add(keeper);
        files.add(remote_file("jars/goner.jar", "bbbb"));

        files.set_action("jars/keeper.jar", Action::Upload).unwrap();
        files.set_action("jars/goner.jar", Action::Remove).unwrap();

        let conflicts = Conflicts::new(&files).list(true);
        let removal = conflicts
            .iter()
            .find(|conflict| conflict.message.contains("about to be removed"))
            .expect("removal conflict");
        assert_eq!(removal.severity, Severity::CriticalError);

        let effect = removal.resolutions[0].effect.clone();
        apply_resolution(&mut files, &effect).unwrap();
        assert!(!files.get("jars/keeper.jar").unwrap().has_dependency("jars/goner.jar"));
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let mut files = collection();
        let mut a = remote_file("jars/a.jar", "aaaa");
        a.add_dependency(Dependency::new("jars/b.jar", 0, false));
        a.set_local_version("jars/a.jar", "mod-a", 20240101000000);
        let mut b = remote_file("jars/b.jar", "bbbb");
        b.add_dependency(Dependency::new("jars/a.jar", 0, false));
        files.add(a);
        files.add(b);
        files.set_action("jars/a.jar", Action::Upload).unwrap();

        let conflicts = Conflicts::new(&files).list(true);
        let cycle = conflicts
            .iter()
            .find(|conflict| conflict.message.contains("Circular"))
            .expect("cycle conflict");
        assert!(
            cycle.message.contains("jars/a.jar -> jars/b.jar -> jars/a.jar")
                || cycle.message.contains("jars/b.jar -> jars/a.jar -> jars/b.jar")
        );
    }
}
