mod list;
mod sites;
mod update;
mod upload;

use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::core::catalog::{fetch, reader};
use crate::core::conflicts::{apply_resolution, needs_feedback, Conflicts};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::{Action, FileRecord, FilesCollection, Status};
use crate::core::progress::{Progress, StderrProgress};
use crate::core::scanner;
use crate::core::util;

#[derive(Parser)]
#[command(
    name = "spectra-updater",
    version,
    about = "Package manager for the Spectra plug-in ecosystem"
)]
pub struct Cli {
    /// The Spectra installation root.
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List known files with status and timestamp
    List { files: Vec<String> },
    /// List files as their current versioned names
    ListCurrent { files: Vec<String> },
    /// List files that are up-to-date
    ListUptodate { files: Vec<String> },
    /// List files that are not up-to-date
    ListNotUptodate { files: Vec<String> },
    /// List files with an update available
    ListUpdateable { files: Vec<String> },
    /// List locally modified files
    ListModified { files: Vec<String> },
    /// List files unknown to every update site
    ListLocalOnly { files: Vec<String> },
    /// List files whose entry shadows another update site's
    ListShadowed { files: Vec<String> },
    /// List the files of one update site
    ListFromSite { name: String },
    /// Show the details of the given files
    Show {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Stage and apply updates
    Update { files: Vec<String> },
    /// Update, overwriting locally modified files
    UpdateForce { files: Vec<String> },
    /// Update, overwriting local changes and deleting obsolete copies
    UpdateForcePristine { files: Vec<String> },
    /// Compare local files with their advertised versions
    Diff {
        #[arg(long)]
        list_files: bool,
        #[arg(long)]
        hex_diff: bool,
        files: Vec<String>,
    },
    /// Show the version history known to the catalogs
    History { files: Vec<String> },
    /// Bring files back to their state at the given timestamp
    Downgrade {
        #[arg(long)]
        simulate: bool,
        timestamp: u64,
        files: Vec<String>,
    },
    /// Re-install files whose local changes are byte-identical upstream
    RevertUnrealChanges {
        #[arg(long)]
        simulate: bool,
        files: Vec<String>,
    },
    /// Upload files to an update site
    Upload {
        #[arg(long)]
        simulate: bool,
        #[arg(long = "update-site", alias = "site")]
        update_site: Option<String>,
        #[arg(long)]
        force_shadow: bool,
        #[arg(long)]
        forget_missing_dependencies: bool,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Upload the whole local state of one update site
    UploadCompleteSite {
        #[arg(long)]
        simulate: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        force_shadow: bool,
        /// Comma-separated platforms to consider active
        #[arg(long)]
        platforms: Option<String>,
        site: String,
    },
    /// List the known update sites
    ListUpdateSites { names: Vec<String> },
    /// Register a new update site
    AddUpdateSite {
        name: String,
        url: String,
        host: Option<String>,
        upload_directory: Option<String>,
    },
    /// Register several update sites: <name> <url> pairs
    AddUpdateSites { args: Vec<String> },
    /// Change an update site's URL or upload settings
    EditUpdateSite {
        name: String,
        url: String,
        host: Option<String>,
        upload_directory: Option<String>,
    },
    /// Forget update sites entirely
    RemoveUpdateSite {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Turn update sites off without forgetting them
    DeactivateUpdateSite {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Re-read the remote catalogs, applying known URL rewrites
    RefreshUpdateSites {
        #[arg(long)]
        simulate: bool,
        #[arg(long)]
        updateall: bool,
    },
}

pub async fn run(cli: Cli) -> UpdaterResult<()> {
    let mut session = Session::new(cli.root);
    match cli.command {
        Command::List { files } => list::list(&mut session, &files, None).await,
        Command::ListCurrent { files } => list::list_current(&mut session, &files).await,
        Command::ListUptodate { files } => {
            list::list(&mut session, &files, Some(StatusFilter::Is(Status::Installed))).await
        }
        Command::ListNotUptodate { files } => {
            list::list(
                &mut session,
                &files,
                Some(StatusFilter::NoneOf(vec![
                    Status::Obsolete,
                    Status::Installed,
                    Status::LocalOnly,
                ])),
            )
            .await
        }
        Command::ListUpdateable { files } => {
            list::list(&mut session, &files, Some(StatusFilter::Is(Status::Updateable))).await
        }
        Command::ListModified { files } => {
            list::list(&mut session, &files, Some(StatusFilter::Is(Status::Modified))).await
        }
        Command::ListLocalOnly { files } => {
            list::list(&mut session, &files, Some(StatusFilter::Is(Status::LocalOnly))).await
        }
        Command::ListShadowed { files } => list::list_shadowed(&mut session, &files).await,
        Command::ListFromSite { name } => list::list_from_site(&mut session, &name).await,
        Command::Show { files } => list::show(&mut session, &files).await,
        Command::Update { files } => update::update(&mut session, &files, false, false).await,
        Command::UpdateForce { files } => update::update(&mut session, &files, true, false).await,
        Command::UpdateForcePristine { files } => {
            update::update(&mut session, &files, true, true).await
        }
        Command::Diff {
            list_files,
            hex_diff,
            files,
        } => update::diff(&mut session, &files, list_files, hex_diff).await,
        Command::History { files } => list::history(&mut session, &files).await,
        Command::Downgrade {
            simulate,
            timestamp,
            files,
        } => update::downgrade(&mut session, timestamp, &files, simulate).await,
        Command::RevertUnrealChanges { simulate, files } => {
            update::revert_unreal_changes(&mut session, &files, simulate).await
        }
        Command::Upload {
            simulate,
            update_site,
            force_shadow,
            forget_missing_dependencies,
            files,
        } => {
            upload::upload(
                &mut session,
                &files,
                upload::UploadOptions {
                    simulate,
                    update_site,
                    force_shadow,
                    forget_missing_dependencies,
                },
            )
            .await
        }
        Command::UploadCompleteSite {
            simulate,
            force,
            force_shadow,
            platforms,
            site,
        } => {
            upload::upload_complete_site(
                &mut session,
                &site,
                upload::CompleteSiteOptions {
                    simulate,
                    force,
                    force_shadow,
                    platforms,
                },
            )
            .await
        }
        Command::ListUpdateSites { names } => sites::list_update_sites(&mut session, &names).await,
        Command::AddUpdateSite {
            name,
            url,
            host,
            upload_directory,
        } => sites::add_or_edit_update_site(&mut session, &name, &url, host, upload_directory, true).await,
        Command::AddUpdateSites { args } => sites::add_update_sites(&mut session, &args).await,
        Command::EditUpdateSite {
            name,
            url,
            host,
            upload_directory,
        } => {
            sites::add_or_edit_update_site(&mut session, &name, &url, host, upload_directory, false)
                .await
        }
        Command::RemoveUpdateSite { names } => sites::remove_update_sites(&mut session, &names).await,
        Command::DeactivateUpdateSite { names } => {
            sites::deactivate_update_sites(&mut session, &names).await
        }
        Command::RefreshUpdateSites { simulate, updateall } => {
            sites::refresh_update_sites(&mut session, simulate, updateall).await
        }
    }
}

pub enum StatusFilter {
    Is(Status),
    NoneOf(Vec<Status>),
}

impl StatusFilter {
    fn matches(&self, status: Status) -> bool {
        match self {
            StatusFilter::Is(wanted) => status == *wanted,
            StatusFilter::NoneOf(excluded) => !excluded.contains(&status),
        }
    }
}

/// Shared command state: the collection, lazily checksummed once.
pub struct Session {
    pub files: FilesCollection,
    pub progress: StderrProgress,
    checksummed: bool,
    index_warnings: String,
}

impl Session {
    pub fn new(root: PathBuf) -> Self {
        Self {
            files: FilesCollection::new(root),
            progress: StderrProgress::new(79),
            checksummed: false,
            index_warnings: String::new(),
        }
    }

    /// Unreachable sites degrade to "treat as up-to-date" for read-only
    /// commands, but nothing may modify local state on a stale index.
    pub fn require_complete_index(&self) -> UpdaterResult<()> {
        if self.index_warnings.is_empty() {
            return Ok(());
        }
        Err(UpdaterError::NetworkUnavailable {
            url: self.index_warnings.trim_end().to_string(),
        })
    }

    /// Load the local catalog, refresh every remote index and checksum the
    /// installation. All commands start here.
    pub async fn ensure_checksummed(&mut self) -> UpdaterResult<()> {
        if self.checksummed {
            return Ok(());
        }
        // The local catalog contributes the site table and its timestamps;
        // the records themselves are rebuilt from the remote indexes.
        reader::read_local_catalog(&mut self.files)?;
        self.files.clear_files();

        let warnings = fetch::download_index(&mut self.files, &mut self.progress).await?;
        if !warnings.is_empty() {
            warn!("{}", warnings.trim_end());
        }
        self.index_warnings = warnings;
        scanner::checksum_all(&mut self.files, &mut self.progress)?;

        // When upstream fixed dependencies, heed them.
        let up_to_date: Vec<String> = self
            .files
            .up_to_date()
            .map(FileRecord::filename_stripped)
            .collect();
        for key in up_to_date {
            for dep_key in self.files.file_dependencies(&key, false) {
                let wants_install = self.files.get(&dep_key).is_some_and(|dep| {
                    dep.action() == Action::NotInstalled
                        && dep.is_active_platform(self.files.active_platforms())
                });
                if wants_install {
                    self.files.set_action(&dep_key, Action::Install)?;
                }
            }
        }

        self.checksummed = true;
        Ok(())
    }

    /// Does a file pass the command-line name filter?
    pub fn file_matches(&self, file: &FileRecord, names: &[String]) -> bool {
        if !self.files.matches_platform(file) {
            return false;
        }
        if file.status() == Status::ObsoleteUninstalled {
            return false;
        }
        if names.is_empty() {
            return true;
        }
        let wanted: HashSet<String> = names
            .iter()
            .map(|name| util::strip_filename_version(name))
            .collect();
        wanted.contains(&file.filename_stripped())
    }

    /// Run the conflict engine to stability.
    ///
    /// Blocking conflicts prompt on a terminal; without one they abort with
    /// the full listing, which is the only batch-safe answer.
    pub fn resolve_conflicts(&mut self, for_upload: bool) -> UpdaterResult<()> {
        loop {
            let conflicts = Conflicts::new(&self.files).list(for_upload);
            if !needs_feedback(&conflicts) {
                for conflict in &conflicts {
                    info!("{conflict}");
                }
                return Ok(());
            }
            if !std::io::stdin().is_terminal() {
                return Err(UpdaterError::Conflicts(util::join("\n", conflicts.iter())));
            }
            for conflict in &conflicts {
                eprintln!("{conflict}");
                if conflict.resolutions.is_empty() {
                    return Err(UpdaterError::Conflicts(conflict.to_string()));
                }
                eprintln!("\nResolutions:");
                for (index, resolution) in conflict.resolutions.iter().enumerate() {
                    eprintln!("{:3} {}", index + 1, resolution.description);
                }
                let effect = loop {
                    eprint!("\nResolution? ");
                    let mut answer = String::new();
                    std::io::stdin()
                        .read_line(&mut answer)
                        .map_err(UpdaterError::io("<stdin>"))?;
                    let answer = answer.trim();
                    if answer.is_empty() || answer.to_lowercase().starts_with('x') {
                        return Err(UpdaterError::Other("Aborted".to_string()));
                    }
                    match answer.parse::<usize>() {
                        Ok(choice) if choice >= 1 && choice <= conflict.resolutions.len() => {
                            break conflict.resolutions[choice - 1].effect.clone();
                        }
                        _ => eprintln!("Invalid answer: {answer}"),
                    }
                };
                apply_resolution(&mut self.files, &effect)?;
            }
        }
    }
}
