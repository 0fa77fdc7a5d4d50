use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::conflicts::{needs_feedback, Conflicts};
use crate::core::download::{Download, Downloader};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::hasher;
use crate::core::model::{FilesCollection, Status};
use crate::core::progress::Progress;
use crate::core::util;

/// The macOS application bundle is signed as one unit; its files are
/// replaced together, never through the staging area.
pub const APP_BUNDLE: &str = "Spectra.app";
pub const APP_BUNDLE_BACKUP: &str = "Spectra.old.app";

struct StagedDownload {
    request: Download,
    /// Logical filename, which seeds the digest.
    filename: String,
    expected_checksum: String,
    timestamp: u64,
    executable: bool,
}

/// Applies staged actions to the installation.
///
/// Regular files download into `update/` and only move into place in a
/// final pass; launchers, the native-configurator files and everything in
/// the application bundle are replaced directly, with `.old` backups as the
/// recovery path, because those paths must be valid at launch time.
pub struct Installer<'a> {
    files: &'a mut FilesCollection,
}

impl<'a> Installer<'a> {
    pub fn new(files: &'a mut FilesCollection) -> Self {
        Self { files }
    }

    pub async fn start(&mut self, progress: &mut dyn Progress) -> UpdaterResult<()> {
        check_root_writable(self.files.root())?;
        let conflicts = Conflicts::new(self.files).list(false);
        if needs_feedback(&conflicts) {
            return Err(UpdaterError::Conflicts(util::join("\n", conflicts.iter())));
        }

        // Mark for removal first; uninstalls must not race the downloads.
        let uninstall_keys = self.files.keys_where(|file| file.to_uninstall());
        let uninstall_local_only: Vec<String> = self
            .files
            .iter()
            .filter(|file| file.to_uninstall() && file.is_local_only())
            .map(|file| file.filename_stripped())
            .collect();
        for key in &uninstall_keys {
            self.files.stage_for_uninstall(key)?;
        }

        self.backup_bundle_if_touched()?;

        let mut staged: Vec<StagedDownload> = Vec::new();
        let download_keys = self
            .files
            .keys_where(|file| file.to_install_or_update());
        for key in &download_keys {
            let Some(file) = self.files.get(key) else {
                continue;
            };
            let name = file.filename.clone();
            let local_name = file.local_filename.clone();
            let executable = file.executable;
            let expected_size = file.filesize;
            let expected_checksum = file
                .checksum()
                .map(String::from)
                .ok_or_else(|| UpdaterError::UnknownFile(name.clone()))?;
            let timestamp = file.timestamp();
            let url = self
                .files
                .update_url(file)
                .ok_or_else(|| UpdaterError::UnknownSite(format!("for {name}")))?;

            // A versioned rename leaves a stale file under the old name.
            if let Some(local) = &local_name {
                if *local != name {
                    util::touch(&self.files.prefix_update(local))?;
                }
            }

            let destination = self.stage_destination(&name, executable)?;
            staged.push(StagedDownload {
                request: Download {
                    url,
                    destination,
                    name: name.clone(),
                    expected_size,
                },
                filename: name,
                expected_checksum,
                timestamp,
                executable,
            });
        }

        let requests: Vec<Download> = staged.iter().map(|item| item.request.clone()).collect();
        let verification: Vec<StagedDownload> = staged;
        Downloader::default()
            .download_batch(
                requests,
                |request| {
                    let item = verification
                        .iter()
                        .find(|item| item.request.name == request.name)
                        .ok_or_else(|| UpdaterError::UnknownFile(request.name.clone()))?;
                    verify_download(item)
                },
                progress,
            )
            .await?;

        // Everything verified: reflect the new local state in the model.
        for item in &verification {
            if item.executable {
                set_executable(&item.request.destination)?;
            }
            if let Some(file) = self.files.get_mut(&item.filename) {
                let filename = item.filename.clone();
                file.set_local_version(&filename, &item.expected_checksum, item.timestamp);
                file.set_status(Status::Installed);
            }
        }
        for key in uninstall_local_only {
            self.files.remove(&key);
        }
        Ok(())
    }

    /// Destination for one download: `update/<name>` normally, the final
    /// path for bundle contents and for launcher-type files (which are
    /// sidestepped to `.old` right now).
    fn stage_destination(&self, name: &str, executable: bool) -> UpdaterResult<PathBuf> {
        if name.contains(APP_BUNDLE) {
            return Ok(self.files.prefix(name));
        }
        let direct = executable || name.contains("config/strut");
        if !direct {
            return Ok(self.files.prefix_update(name));
        }
        let destination = self.files.prefix(name);
        if destination.exists() {
            let mut old = format!("{}.old", destination.display());
            if old.ends_with(".exe.old") {
                old = format!("{}.old.exe", &old[..old.len() - 8]);
            }
            let old = PathBuf::from(old);
            if old.exists() {
                let _ = std::fs::remove_file(&old);
            }
            std::fs::rename(&destination, &old).map_err(UpdaterError::io(&destination))?;
        }
        Ok(destination)
    }

    /// When anything inside the application bundle is staged, the whole
    /// bundle is backed up and every installed file in it re-staged, so the
    /// signed tree is refreshed as one unit.
    fn backup_bundle_if_touched(&mut self) -> UpdaterResult<()> {
        let touches_bundle = self
            .files
            .to_install_or_update()
            .any(|file| file.filename.contains(APP_BUNDLE));
        if !touches_bundle {
            return Ok(());
        }
        let bundle = self.files.prefix(APP_BUNDLE);
        if !bundle.exists() {
            return Ok(());
        }
        let backup = self.files.prefix(APP_BUNDLE_BACKUP);
        if backup.exists() {
            std::fs::remove_dir_all(&backup).map_err(UpdaterError::io(&backup))?;
        }
        copy_directory(&bundle, &backup)?;
        info!("Backed up {APP_BUNDLE} to {APP_BUNDLE_BACKUP}");

        let installed_in_bundle = self.files.keys_where(|file| {
            file.filename.contains(APP_BUNDLE)
                && !matches!(file.status(), Status::LocalOnly | Status::NotInstalled)
        });
        for key in installed_in_bundle {
            self.files.stage_for_update(&key, true)?;
        }
        Ok(())
    }

    /// Commit the staging area: delete where a zero-length placeholder
    /// marks a removal, rename everything else over its target.
    pub fn move_updated_into_place(&mut self) -> UpdaterResult<()> {
        let update_dir = self.files.prefix("update");
        let root = self.files.root().to_path_buf();
        move_tree(&update_dir, &root)
    }
}

/// The root must accept writes before any staging begins. On Windows,
/// `Program Files` and friends are virtualized for unprivileged writers,
/// which would silently fork the installation.
fn check_root_writable(root: &Path) -> UpdaterResult<()> {
    #[cfg(windows)]
    {
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "SystemRoot"] {
            if let Ok(protected) = std::env::var(key) {
                if root.starts_with(&protected) {
                    return Err(UpdaterError::ProtectedLocation(root.to_path_buf()));
                }
            }
        }
    }
    let probe = root.join(".writable");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => Err(UpdaterError::ReadOnlyRoot(root.to_path_buf())),
    }
}

fn verify_download(item: &StagedDownload) -> UpdaterResult<()> {
    let destination = &item.request.destination;
    let actual_size = std::fs::metadata(destination)
        .map(|metadata| metadata.len())
        .map_err(UpdaterError::io(destination))?;
    if actual_size != item.request.expected_size {
        return Err(UpdaterError::SizeMismatch {
            path: destination.clone(),
            expected: item.request.expected_size,
            actual: actual_size,
        });
    }
    let digests = hasher::all_digests(&item.filename, destination)?;
    if !digests.iter().any(|digest| *digest == item.expected_checksum) {
        return Err(UpdaterError::DigestMismatch {
            path: destination.clone(),
            expected: item.expected_checksum.clone(),
            actual: digests.into_iter().next().unwrap_or_default(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> UpdaterResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)
        .map_err(UpdaterError::io(path))?
        .permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).map_err(UpdaterError::io(path))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> UpdaterResult<()> {
    Ok(())
}

fn move_tree(source_dir: &Path, target_dir: &Path) -> UpdaterResult<()> {
    if !source_dir.is_dir() {
        return Ok(());
    }
    if !target_dir.is_dir() {
        std::fs::create_dir_all(target_dir).map_err(UpdaterError::io(target_dir))?;
    }
    let entries = std::fs::read_dir(source_dir).map_err(UpdaterError::io(source_dir))?;
    for entry in entries {
        let entry = entry.map_err(UpdaterError::io(source_dir))?;
        let source = entry.path();
        let target = target_dir.join(entry.file_name());
        let file_type = entry.file_type().map_err(UpdaterError::io(&source))?;
        if file_type.is_dir() {
            move_tree(&source, &target)?;
        } else if file_type.is_file() {
            let length = entry
                .metadata()
                .map_err(UpdaterError::io(&source))?
                .len();
            if length == 0 {
                // A placeholder: the corresponding file is to be deleted.
                if target.exists() {
                    std::fs::remove_file(&target).map_err(UpdaterError::io(&target))?;
                }
                std::fs::remove_file(&source).map_err(UpdaterError::io(&source))?;
            } else if let Err(first_error) = std::fs::rename(&source, &target) {
                debug!("Direct rename of {source:?} failed: {first_error}");
                let unblocked = std::fs::remove_file(&target).is_ok()
                    || move_out_of_the_way(&target);
                if !unblocked || std::fs::rename(&source, &target).is_err() {
                    return Err(UpdaterError::Other(format!(
                        "Could not move '{}' to '{}'",
                        source.display(),
                        target.display()
                    )));
                }
            }
        }
    }
    std::fs::remove_dir(source_dir).map_err(UpdaterError::io(source_dir))?;
    Ok(())
}

/// Rename a locked target aside: `<name>.old`, then `<name>.old2` and so
/// on, keeping `.exe`/`.dll` suffixes so Windows still recognizes the file.
fn move_out_of_the_way(file: &Path) -> bool {
    if !file.exists() {
        return true;
    }
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let (prefix, suffix) = if name.to_ascii_lowercase().ends_with(".exe")
        || name.to_ascii_lowercase().ends_with(".dll")
    {
        let split = name.len() - 4;
        (name[..split].to_string(), name[split..].to_string())
    } else {
        (name, String::new())
    };
    let parent = match file.parent() {
        Some(parent) => parent.to_path_buf(),
        None => return false,
    };
    let mut backup = parent.join(format!("{prefix}.old{suffix}"));
    if backup.exists() && std::fs::remove_file(&backup).is_err() {
        let mut counter = 2;
        loop {
            backup = parent.join(format!("{prefix}.old{counter}{suffix}"));
            if !backup.exists() {
                break;
            }
            counter += 1;
        }
    }
    std::fs::rename(file, &backup).is_ok()
}

fn copy_directory(source: &Path, target: &Path) -> UpdaterResult<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|error| {
            UpdaterError::Other(format!("walking {}: {error}", source.display()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| UpdaterError::Other("walk escaped the source tree".to_string()))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination).map_err(UpdaterError::io(&destination))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).map_err(UpdaterError::io(parent))?;
            }
            std::fs::copy(entry.path(), &destination).map_err(UpdaterError::io(entry.path()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_tree_renames_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let update = root.join("update");

        std::fs::create_dir_all(update.join("macros")).unwrap();
        std::fs::write(update.join("macros/new.ijm"), b"new contents").unwrap();
        // zero-length placeholder: delete macros/old.ijm
        std::fs::write(update.join("macros/old.ijm"), b"").unwrap();
        std::fs::create_dir_all(root.join("macros")).unwrap();
        std::fs::write(root.join("macros/old.ijm"), b"stale").unwrap();

        move_tree(&update, root).unwrap();

        assert_eq!(
            std::fs::read(root.join("macros/new.ijm")).unwrap(),
            b"new contents"
        );
        assert!(!root.join("macros/old.ijm").exists());
        assert!(!update.exists());
    }

    #[test]
    fn move_out_of_the_way_keeps_exe_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("launcher.exe");
        std::fs::write(&target, b"binary").unwrap();
        assert!(move_out_of_the_way(&target));
        assert!(dir.path().join("launcher.old.exe").exists());
        assert!(!target.exists());
    }

    #[test]
    fn copy_directory_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Spectra.app");
        std::fs::create_dir_all(source.join("Contents/MacOS")).unwrap();
        std::fs::write(source.join("Contents/MacOS/spectra"), b"bin").unwrap();

        let target = dir.path().join("Spectra.old.app");
        copy_directory(&source, &target).unwrap();
        assert_eq!(
            std::fs::read(target.join("Contents/MacOS/spectra")).unwrap(),
            b"bin"
        );
    }
}
