use tracing::info;

use super::Session;
use crate::core::catalog::{fetch, writer};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::installer::Installer;
use crate::core::model::format_url;
use crate::core::scanner;

pub async fn list_update_sites(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    let names = if names.is_empty() {
        session.files.site_names(true)
    } else {
        names.to_vec()
    };
    for name in names {
        let Some(site) = session.files.get_site(&name, true) else {
            return Err(UpdaterError::UnknownSite(name));
        };
        let disabled = if site.active { "" } else { " (DISABLED)" };
        match site.upload_directory() {
            None => println!("{name}{disabled}: {}", site.url()),
            Some(dir) => println!(
                "{name}{disabled}: {} (upload host: {}, upload directory: {dir})",
                site.url(),
                site.host.as_deref().unwrap_or("<none>")
            ),
        }
    }
    Ok(())
}

pub async fn add_or_edit_update_site(
    session: &mut Session,
    name: &str,
    url: &str,
    host: Option<String>,
    upload_directory: Option<String>,
    add: bool,
) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    let existing = session.files.get_site(name, false).is_some();
    if add && existing {
        return Err(UpdaterError::Other(format!("Site '{name}' was already added!")));
    }
    if existing {
        if let Some(site) = session.files.get_site_mut(name) {
            site.set_url(url.to_string());
            site.host = host;
            site.set_upload_directory(upload_directory);
            site.active = true;
        }
    } else {
        session
            .files
            .add_update_site(name, url, host, upload_directory, 0);
    }
    writer::write_local(&mut session.files)
}

pub async fn add_update_sites(session: &mut Session, args: &[String]) -> UpdaterResult<()> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(UpdaterError::Other(
            "Usage: add-update-sites <name1> <url1> [<name2> <url2> ...]".to_string(),
        ));
    }
    session.ensure_checksummed().await?;
    for pair in args.chunks(2) {
        let (name, url) = (&pair[0], &pair[1]);
        if session.files.get_site(name, false).is_some() {
            return Err(UpdaterError::Other(format!("Site '{name}' was already added!")));
        }
        session.files.add_update_site(name, url, None, None, 0);
    }
    writer::write_local(&mut session.files)
}

pub async fn remove_update_sites(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    for name in names {
        session.files.remove_update_site(name)?;
    }
    writer::write_local(&mut session.files)
}

pub async fn deactivate_update_sites(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    for name in names {
        let count = session.files.deactivate_update_site(name)?;
        info!("Deactivated '{name}' ({count} files affected)");
    }
    // Stage the resulting changes; they apply on the next `update` (moving
    // them now would yank files out from under the running application).
    let mut installer = Installer::new(&mut session.files);
    installer.start(&mut session.progress).await?;
    writer::write_local(&mut session.files)
}

pub async fn refresh_update_sites(
    session: &mut Session,
    simulate: bool,
    updateall: bool,
) -> UpdaterResult<()> {
    crate::core::catalog::reader::read_local_catalog(&mut session.files)?;

    let names = session.files.site_names(true);
    for name in names {
        let Some(site) = session.files.get_site(&name, true) else {
            continue;
        };
        let current = site.url().to_string();
        let rewritten = format_url(&current);
        let recommended = rewritten != current && !site.keep_url;
        let approved = updateall || recommended;
        if rewritten == current {
            continue;
        }
        if approved {
            println!("  [UPDATE] {name}: {current} -> {rewritten}");
            if !simulate {
                if let Some(site) = session.files.get_site_mut(&name) {
                    site.set_url(rewritten);
                }
            }
        } else {
            println!("  [KEEP] {name}: {current} (new: {rewritten})");
        }
    }

    if simulate {
        return Ok(());
    }
    session.files.clear_files();
    let warnings = fetch::download_index(&mut session.files, &mut session.progress).await?;
    if !warnings.is_empty() {
        tracing::warn!("{}", warnings.trim_end());
    }
    scanner::checksum_all(&mut session.files, &mut session.progress)?;
    writer::write_local(&mut session.files)
}
