use tracing::{info, warn};

use super::Session;
use crate::core::catalog::writer;
use crate::core::conflicts::{needs_feedback, Conflicts, ResolutionEffect};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::{Action, Status};
use crate::core::platform;
use crate::core::uploader::FilesUploader;
use crate::core::util;

pub struct UploadOptions {
    pub simulate: bool,
    pub update_site: Option<String>,
    pub force_shadow: bool,
    pub forget_missing_dependencies: bool,
}

pub async fn upload(
    session: &mut Session,
    names: &[String],
    options: UploadOptions,
) -> UpdaterResult<()> {
    if options.force_shadow && options.update_site.is_none() {
        return Err(UpdaterError::Other(
            "Need an explicit update site with --force-shadow".to_string(),
        ));
    }
    session.ensure_checksummed().await?;

    let mut update_site = options.update_site.clone();
    let mut count = 0;
    for name in names {
        let Some(file) = session.files.get(name) else {
            return Err(UpdaterError::UnknownFile(name.clone()));
        };
        let key = file.filename_stripped();
        let status = file.status();
        let file_site = file.update_site.clone();
        let unrenamed = file
            .local_filename
            .as_deref()
            .map_or(true, |local| local == file.filename);

        if status == Status::Installed && unrenamed {
            match (&update_site, options.force_shadow) {
                (Some(site), true) if file_site.as_deref() != Some(site.as_str()) => {
                    if let Some(file) = session.files.get_mut(&key) {
                        file.update_site = Some(site.clone());
                        file.set_status(Status::Modified);
                    }
                    info!("Uploading (force-shadow) '{name}' to site '{site}'");
                }
                _ => {
                    info!("Skipping up-to-date {name}");
                    continue;
                }
            }
        }

        handle_launcher_for_upload(session, &key);

        match (update_site.clone(), file_site.clone()) {
            (None, Some(site)) => update_site = Some(site),
            (None, None) => {
                return Err(UpdaterError::Other(format!(
                    "Cannot determine update site for '{name}'; use --update-site"
                )))
            }
            (Some(site), Some(owner)) if site != owner => {
                if options.update_site.is_some() {
                    if let Some(file) = session.files.get_mut(&key) {
                        file.update_site = Some(site);
                    }
                } else {
                    return Err(UpdaterError::Other(format!(
                        "Cannot upload to multiple update sites ({owner} and {site})"
                    )));
                }
            }
            (Some(site), None) => {
                info!("Uploading new file '{name}' to site '{site}'");
                if let Some(file) = session.files.get_mut(&key) {
                    file.update_site = Some(site);
                }
            }
            _ => {}
        }

        let status = session
            .files
            .get(&key)
            .map(|file| file.status())
            .unwrap_or(status);
        if matches!(status, Status::NotInstalled | Status::New) {
            info!("Removing file '{name}'");
            session.files.set_action(&key, Action::Remove)?;
        } else {
            if options.simulate {
                info!("Would upload '{name}'");
            }
            // A versioned local rename leaves a history entry carrying the
            // catalog's old filename.
            let renamed = session.files.get(&key).and_then(|file| {
                file.local_filename
                    .as_deref()
                    .filter(|local| *local != file.filename)
                    .and_then(|_| file.current.clone().map(|current| (file.filename.clone(), current)))
            });
            if let Some((old_name, mut version)) = renamed {
                if let Some(file) = session.files.get_mut(&key) {
                    version.filename = Some(old_name);
                    file.add_previous_version(version);
                }
            }
            session.files.set_action(&key, Action::Upload)?;
        }
        count += 1;
    }

    if count == 0 {
        info!("Nothing to upload");
        return Ok(());
    }
    let Some(site_name) = update_site else {
        return Err(UpdaterError::Other("No update site selected".to_string()));
    };
    if session.files.get_site(&site_name, false).is_none() {
        return Err(UpdaterError::UnknownSite(site_name));
    }

    if options.forget_missing_dependencies {
        forget_missing_dependencies(session)?;
    }

    if options.simulate {
        report_simulation(session, &site_name, count, 0);
        return Ok(());
    }
    if let Some(errors) = session.files.check_consistency() {
        return Err(UpdaterError::Other(errors));
    }

    info!("Uploading to {}", long_site_name(session, &site_name));
    perform_upload(session, &site_name).await
}

pub struct CompleteSiteOptions {
    pub simulate: bool,
    pub force: bool,
    pub force_shadow: bool,
    pub platforms: Option<String>,
}

pub async fn upload_complete_site(
    session: &mut Session,
    site_name: &str,
    options: CompleteSiteOptions,
) -> UpdaterResult<()> {
    if let Some(platforms) = &options.platforms {
        let list: Vec<String> = platforms.split(',').map(String::from).collect();
        session.files.set_active_platforms(&list);
    }
    session.ensure_checksummed().await?;
    if session.files.get_site(site_name, false).is_none() {
        return Err(UpdaterError::UnknownSite(site_name.to_string()));
    }

    let mut upload_count = 0;
    let mut remove_count = 0;
    let mut warning_count = 0;
    let keys = session
        .files
        .keys_where(|file| file.is_active_platform(session.files.active_platforms()));
    for key in keys {
        handle_launcher_for_upload(session, &key);
        let Some(file) = session.files.get(&key) else {
            continue;
        };
        let name = file.filename.clone();
        let file_site = file.update_site.clone();
        match file.status() {
            Status::Obsolete | Status::ObsoleteModified => {
                if options.force_shadow {
                    if let Some(file) = session.files.get_mut(&key) {
                        file.update_site = Some(site_name.to_string());
                    }
                    session.files.set_action(&key, Action::Upload)?;
                    if options.simulate {
                        info!("Would upload {name}");
                    }
                    upload_count += 1;
                } else if options.force && file_site.as_deref() == Some(site_name) {
                    session.files.set_action(&key, Action::Upload)?;
                    if options.simulate {
                        info!("Would re-upload {name}");
                    }
                    upload_count += 1;
                } else {
                    warn!("Obsolete '{name}' still installed!");
                    warning_count += 1;
                }
            }
            Status::Updateable | Status::Modified | Status::LocalOnly => {
                let foreign = file_site.as_deref().is_some_and(|site| site != site_name);
                if foreign && !options.force_shadow {
                    warn!(
                        "'{name}' of update site '{}' is not up-to-date!",
                        file_site.as_deref().unwrap_or("<none>")
                    );
                    warning_count += 1;
                    continue;
                }
                if let Some(file) = session.files.get_mut(&key) {
                    file.update_site = Some(site_name.to_string());
                }
                session.files.set_action(&key, Action::Upload)?;
                if options.simulate {
                    info!("Would upload new version of {name}");
                }
                upload_count += 1;
            }
            Status::New | Status::NotInstalled => {
                session.files.set_action(&key, Action::Remove)?;
                if options.simulate {
                    info!("Would mark {name} obsolete");
                }
                remove_count += 1;
            }
            Status::Installed | Status::ObsoleteUninstalled => {}
        }
    }

    // Files that end up-to-date must not depend on files going away.
    let site_keys: Vec<String> = session
        .files
        .for_update_site(site_name, false)
        .iter()
        .map(|file| file.filename_stripped())
        .collect();
    for key in &site_keys {
        let Some(file) = session.files.get(key) else {
            continue;
        };
        if !file.will_be_up_to_date() {
            continue;
        }
        let going_away: Vec<String> = session
            .files
            .file_dependencies(key, false)
            .into_iter()
            .filter(|dep_key| {
                session.files.get(dep_key).is_some_and(|dep| {
                    dep.will_not_be_installed()
                        && dep.update_site.as_deref() == Some(site_name)
                })
            })
            .collect();
        let obsolete_deps: Vec<String> = if options.force {
            session
                .files
                .get(key)
                .map(|file| {
                    file.dependencies
                        .iter()
                        .filter(|dep| {
                            session
                                .files
                                .get(&dep.filename)
                                .is_some_and(|other| other.is_obsolete())
                        })
                        .map(|dep| dep.filename.clone())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        if let Some(file) = session.files.get_mut(key) {
            for dependency in going_away.iter().chain(&obsolete_deps) {
                file.remove_dependency(dependency);
            }
        }
    }

    if !options.force && warning_count > 0 {
        return Err(UpdaterError::Other(
            "Use --force to ignore warnings and upload anyway".to_string(),
        ));
    }
    if upload_count == 0 && remove_count == 0 {
        info!("Nothing to upload");
        return Ok(());
    }

    if options.simulate {
        report_simulation(session, site_name, upload_count, remove_count);
        return Ok(());
    }
    if let Some(errors) = session.files.check_consistency() {
        return Err(UpdaterError::Other(errors));
    }

    info!(
        "Uploading {upload_count} (removing {remove_count}) to {}",
        long_site_name(session, site_name)
    );
    perform_upload(session, site_name).await
}

async fn perform_upload(session: &mut Session, site_name: &str) -> UpdaterResult<()> {
    session.require_complete_index()?;
    session.resolve_conflicts(true)?;
    let mut uploader = FilesUploader::new(&mut session.files, site_name)?;
    uploader.login().await?;
    let result = uploader.upload(&mut session.progress).await;
    if result.is_err() {
        uploader.logout().await;
    }
    result?;
    writer::write_local(&mut session.files)
}

/// Local-only launchers gain their platform tag, the executable flag and a
/// dependency on the launcher support bundle before being published.
fn handle_launcher_for_upload(session: &mut Session, key: &str) {
    let Some(file) = session.files.get(key) else {
        return;
    };
    if file.status() != Status::LocalOnly || !platform::is_launcher(&file.filename) {
        return;
    }
    let filename = file.filename.clone();
    let tag = platform::platform_for_launcher(&filename);
    let support = session
        .files
        .get("jars/spectra-launcher.jar")
        .map(|dep| (dep.filename_stripped(), dep.timestamp()));
    if let Some(file) = session.files.get_mut(key) {
        file.executable = true;
        if let Some(tag) = tag {
            file.add_platform(tag);
        }
        if let Some((dep_name, dep_timestamp)) = support {
            file.add_dependency(crate::core::model::Dependency::new(
                dep_name,
                dep_timestamp,
                false,
            ));
        }
    }
}

fn forget_missing_dependencies(session: &mut Session) -> UpdaterResult<()> {
    let conflicts = Conflicts::new(&session.files).list(true);
    for conflict in conflicts {
        if !conflict.message.contains("about to be removed") {
            continue;
        }
        info!("Breaking dependency: {conflict}");
        for resolution in &conflict.resolutions {
            if let ResolutionEffect::BreakDependency { .. } = &resolution.effect {
                crate::core::conflicts::apply_resolution(&mut session.files, &resolution.effect)?;
                break;
            }
        }
    }
    Ok(())
}

fn report_simulation(session: &Session, site_name: &str, uploads: usize, removals: usize) {
    let conflicts = Conflicts::new(&session.files).list(true);
    if needs_feedback(&conflicts) {
        warn!(
            "Unresolved upload conflicts!\n\n{}",
            util::join("\n", conflicts.iter())
        );
    } else {
        info!(
            "Would upload {uploads} (removing {removals}) to/from {}",
            long_site_name(session, site_name)
        );
    }
    if let Some(errors) = session.files.check_consistency() {
        warn!("{errors}");
    }
}

fn long_site_name(session: &Session, name: &str) -> String {
    match session.files.get_site(name, true) {
        Some(site) => {
            let host = site
                .host
                .as_deref()
                .map(|host| format!("{host}:"))
                .unwrap_or_default();
            format!(
                "{name} ({host}{})",
                site.upload_directory().unwrap_or_default()
            )
        }
        None => name.to_string(),
    }
}
