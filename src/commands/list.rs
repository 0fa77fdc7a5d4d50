use std::collections::BTreeMap;

use tracing::error;

use super::{Session, StatusFilter};
use crate::core::error::UpdaterResult;
use crate::core::model::Status;
use crate::core::util;

pub async fn list(
    session: &mut Session,
    names: &[String],
    filter: Option<StatusFilter>,
) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    session.files.sort();
    for file in session.files.iter() {
        if !session.file_matches(file, names) {
            continue;
        }
        if let Some(filter) = &filter {
            if !filter.matches(file.status()) {
                continue;
            }
        }
        println!("{}\t({})\t{}", file.filename, file.status(), file.timestamp());
    }
    Ok(())
}

pub async fn list_current(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    for file in session.files.iter() {
        if session.file_matches(file, names) {
            println!("{}-{}", file.filename, file.timestamp());
        }
    }
    Ok(())
}

pub async fn list_from_site(session: &mut Session, name: &str) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    session.files.sort();
    for file in session.files.iter() {
        if session.file_matches(file, &[]) && file.update_site.as_deref() == Some(name) {
            println!("{}\t({})\t{}", file.filename, file.status(), file.timestamp());
        }
    }
    Ok(())
}

pub async fn list_shadowed(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    session.files.sort();
    for file in session.files.iter() {
        if !session.file_matches(file, names) || !file.overrides_other_site() {
            continue;
        }
        let overridden: Vec<&str> = file
            .overridden_sites
            .iter()
            .filter(|(_, record)| record.current.is_some())
            .map(|(site, _)| site.as_str())
            .collect();
        if overridden.is_empty() {
            continue;
        }
        println!(
            "{}\t({})\t{} overrides {}",
            file.filename,
            file.status(),
            file.update_site.as_deref().unwrap_or("<none>"),
            overridden.join(", ")
        );
    }
    Ok(())
}

pub async fn show(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;
    for name in names {
        let Some(file) = session.files.get(name) else {
            error!("File not found: {name}");
            continue;
        };

        println!();
        println!("File: {}", file.filename_stripped());
        if let Some(local) = &file.local_filename {
            if *local != file.filename_stripped() {
                println!("(Local filename: {local})");
            }
        }
        if let Some(description) = &file.description {
            if !description.is_empty() {
                println!("Description:\n\t{}", description.replace('\n', "\n\t"));
            }
        }
        println!(
            "Update site: {}",
            file.update_site.as_deref().unwrap_or("<none>")
        );
        match &file.current {
            None => println!("Removed from update site"),
            Some(current) => {
                if let Some(url) = session.files.update_url(file) {
                    println!("URL: {url}");
                }
                println!(
                    "checksum: {}, timestamp: {}",
                    current.checksum, current.timestamp
                );
            }
        }
        if let Some(local_checksum) = &file.local_checksum {
            let current_matches = file
                .current
                .as_ref()
                .is_some_and(|current| current.checksum == *local_checksum);
            if !current_matches {
                println!(
                    "Local checksum: {local_checksum} ({}previous version)",
                    if file.has_previous_version(local_checksum) {
                        ""
                    } else {
                        "NOT a "
                    }
                );
            }
        }

        let dependencies = session.files.file_dependencies(name, false);
        if !dependencies.is_empty() {
            println!("Dependencies: {}", dependencies.join(", "));
        }
        let key = file.filename_stripped();
        let all: Vec<String> = session
            .files
            .iter()
            .map(|record| record.filename_stripped())
            .collect();
        let dependees: Vec<String> = session
            .files
            .dependencees(&all, false)
            .into_iter()
            .filter(|(dependency, _)| *dependency == key)
            .flat_map(|(_, dependees)| dependees)
            .collect();
        if !dependees.is_empty() {
            println!("Have '{key}' as dependency: {}", dependees.join(", "));
        }
    }
    Ok(())
}

pub async fn history(session: &mut Session, names: &[String]) -> UpdaterResult<()> {
    session.ensure_checksummed().await?;

    let mut by_timestamp: BTreeMap<u64, Vec<&crate::core::model::FileRecord>> = BTreeMap::new();
    for file in session.files.iter() {
        if !session.file_matches(file, names) || file.status() == Status::LocalOnly {
            continue;
        }
        if let Some(current) = &file.current {
            by_timestamp.entry(current.timestamp).or_default().push(file);
        }
        for version in &file.previous {
            by_timestamp.entry(version.timestamp).or_default().push(file);
        }
    }

    for (timestamp, files) in by_timestamp.iter().rev() {
        println!("{}", util::pretty_timestamp(*timestamp));
        let mut names: Vec<&str> = files
            .iter()
            .filter_map(|file| file.filename_at(*timestamp))
            .collect();
        names.sort();
        names.dedup();
        for name in names {
            println!("\t{name}");
        }
    }
    Ok(())
}
