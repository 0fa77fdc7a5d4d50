use tracing::{error, info, warn};

use super::Session;
use crate::core::catalog::writer;
use crate::core::diff::{show_diff, DiffMode};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::installer::Installer;
use crate::core::model::{Action, Status, Version};
use crate::core::util;

pub async fn update(
    session: &mut Session,
    names: &[String],
    force: bool,
    pristine: bool,
) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;

    // When specific files were requested, newly advertised files must not
    // ride along just because a dependency marked them.
    if !names.is_empty() {
        let keys = session.files.keys_where(|file| {
            file.status() == Status::New && file.action() == Action::Install
        });
        for key in keys {
            session.files.set_action(&key, Action::New)?;
        }
    }

    let keys = session.files.keys_where(|file| session.file_matches(file, names));
    for key in keys {
        let Some(file) = session.files.get(&key) else {
            continue;
        };
        let status = file.status();
        let filename = file.filename.clone();
        match status {
            Status::LocalOnly => {
                if pristine {
                    session.files.set_action(&key, Action::Uninstall)?;
                }
            }
            Status::Obsolete => {
                info!("Removing {filename}");
                session.files.stage_for_uninstall(&key)?;
            }
            Status::ObsoleteModified => {
                if force || pristine {
                    session.files.stage_for_uninstall(&key)?;
                    info!("Removing {filename}");
                } else {
                    warn!("Skipping obsolete, but modified {filename}");
                }
            }
            Status::Installed => {}
            _ => {
                if !session.files.stage_for_update(&key, force)? {
                    warn!("Skipping {filename}");
                }
            }
        }

        // Pristine updates also sweep out stray other-version copies.
        if pristine {
            let correct = session.files.prefix(&filename);
            if let (Some(parent), Some(basename)) = (
                correct.parent(),
                correct.file_name().and_then(|name| name.to_str()),
            ) {
                for version in util::all_versions_of(parent, basename) {
                    if version != correct {
                        info!("Deleting obsolete version {}", version.display());
                        if let Err(err) = std::fs::remove_file(&version) {
                            error!("Could not delete {}: {err}", version.display());
                        }
                    }
                }
            }
        }
    }

    session.resolve_conflicts(false)?;
    apply_staged(session).await
}

async fn apply_staged(session: &mut Session) -> UpdaterResult<()> {
    session.require_complete_index()?;
    let mut installer = Installer::new(&mut session.files);
    installer.start(&mut session.progress).await?;
    installer.move_updated_into_place()?;
    writer::write_local(&mut session.files)
}

pub async fn diff(
    session: &mut Session,
    names: &[String],
    _list_files: bool,
    hex_diff: bool,
) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    let mode = if hex_diff {
        DiffMode::HexDiff
    } else {
        DiffMode::ListFiles
    };
    let mut stdout = std::io::stdout();
    let keys = session.files.keys_where(|file| session.file_matches(file, names));
    for key in keys {
        let Some(file) = session.files.get(&key) else {
            continue;
        };
        let Some(url) = session.files.update_url(file) else {
            continue;
        };
        let local = session.files.prefix(file.local_filename_or_default());
        if !local.exists() {
            continue;
        }
        if let Err(err) = show_diff(&mut stdout, &file.filename, &url, &local, mode).await {
            error!("{err}");
        }
    }
    Ok(())
}

pub async fn downgrade(
    session: &mut Session,
    timestamp: u64,
    names: &[String],
    simulate: bool,
) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;

    let mut count = 0;
    let keys = session.files.keys_where(|file| session.file_matches(file, names));
    for key in keys {
        let Some(file) = session.files.get(&key) else {
            continue;
        };
        if file.status() == Status::LocalOnly {
            continue;
        }

        // Already at (or before) the requested date: just make sure the
        // local copy matches.
        if let Some(current) = &file.current {
            if current.timestamp <= timestamp {
                if Some(current.checksum.as_str()) != file.local_checksum.as_deref() {
                    if simulate {
                        println!("Would update/install {}", file.filename);
                    } else {
                        if let Some(file) = session.files.get_mut(&key) {
                            file.set_status(Status::Updateable);
                        }
                        session
                            .files
                            .set_first_valid_action(&key, &[Action::Update, Action::Install])?;
                    }
                    count += 1;
                }
                continue;
            }
        }

        // Find the version that was current at the requested date.
        let mut matched: Option<(String, String, u64)> = None;
        for version in &file.previous {
            if timestamp >= version.timestamp
                && matched
                    .as_ref()
                    .map_or(true, |(_, _, best)| version.timestamp > *best)
            {
                if let Some(filename) = &version.filename {
                    matched = Some((filename.clone(), version.checksum.clone(), version.timestamp));
                }
            }
        }

        match matched {
            None => {
                // The file did not exist back then.
                if file.local_checksum.is_some() {
                    if simulate {
                        println!("Would uninstall {}", file.local_filename_or_default());
                    } else {
                        session.files.set_action(&key, Action::Uninstall)?;
                    }
                    count += 1;
                }
            }
            Some((filename, checksum, matched_timestamp)) => {
                let changed = filename != file.filename
                    || Some(checksum.as_str()) != file.local_checksum.as_deref();
                if !changed {
                    continue;
                }
                if simulate {
                    println!("Would update/install {filename}");
                } else {
                    if let Some(file) = session.files.get_mut(&key) {
                        let mut version = Version::new(checksum, matched_timestamp);
                        version.filename = Some(filename.clone());
                        file.current = Some(version);
                        file.filename = filename;
                        file.set_status(Status::Updateable);
                    }
                    session
                        .files
                        .set_first_valid_action(&key, &[Action::Update, Action::Install])?;
                }
                count += 1;
            }
        }
    }

    if count == 0 {
        eprintln!("Nothing to do!");
        return Ok(());
    }
    if simulate {
        return Ok(());
    }
    session.resolve_conflicts(false)?;
    apply_staged(session).await
}

/// Stage updates for files whose local "modification" is not real: the
/// bytes upstream are identical, only digest-relevant metadata drifted.
pub async fn revert_unreal_changes(
    session: &mut Session,
    names: &[String],
    simulate: bool,
) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;

    let mut count = 0;
    let keys = session.files.keys_where(|file| session.file_matches(file, names));
    for key in keys {
        let Some(file) = session.files.get(&key) else {
            continue;
        };
        if !matches!(file.status(), Status::Modified | Status::Updateable) {
            continue;
        }
        let Some(url) = session.files.update_url(file) else {
            continue;
        };
        let local = session.files.prefix(file.local_filename_or_default());
        let identical = match fetch_and_compare(&url, &local).await {
            Ok(identical) => identical,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };
        if !identical {
            continue;
        }
        if simulate {
            println!("Would overwrite {}", file.filename);
        } else {
            session.files.set_action(&key, Action::Update)?;
        }
        count += 1;
    }

    if count == 0 {
        eprintln!("Nothing to do!");
        return Ok(());
    }
    if simulate {
        println!("Would overwrite {count} file(s)");
        return Ok(());
    }
    apply_staged(session).await
}

async fn fetch_and_compare(url: &str, local: &std::path::Path) -> UpdaterResult<bool> {
    use crate::core::catalog::fetch::file_url_path;
    let remote_bytes = if let Some(path) = file_url_path(url) {
        std::fs::read(&path).map_err(UpdaterError::io(&path))?
    } else {
        let client = crate::core::http::build_http_client()?;
        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(UpdaterError::DownloadFailed {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.bytes().await?.to_vec()
    };
    let local_bytes = std::fs::read(local).map_err(UpdaterError::io(local))?;
    Ok(remote_bytes == local_bytes)
}
