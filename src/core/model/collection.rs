use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Action, Dependency, FileRecord, Status, UpdateSite, Version};
use crate::core::conflicts::Conflict;
use crate::core::deps::DependencyAnalyzer;
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::{platform, util};

pub const DEFAULT_UPDATE_SITE: &str = "Spectra";
pub const MAIN_URL: &str = "https://update.spectra-imaging.org/";

/// The database of tracked files and update sites.
///
/// Records are keyed by the version-stripped logical filename and iterate in
/// insertion order. Mutations that need cross-record context (action
/// validation, staging cascades, shadow promotion) live here rather than on
/// `FileRecord`, so the borrow of the collection stays in one place.
pub struct FilesCollection {
    root: PathBuf,
    files: Vec<FileRecord>,
    index: HashMap<String, usize>,
    sites: Vec<UpdateSite>,
    pub conflicts: Vec<Conflict>,
    platform: String,
    active_platforms: HashSet<String>,
    sites_changed: bool,
    analyzer: Option<DependencyAnalyzer>,
}

impl FilesCollection {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let platform = platform::current();
        let active_platforms = platform::infer_active(Some(&root));
        let timestamp = util::file_timestamp(&root.join(util::XML_COMPRESSED)).unwrap_or(0);

        let mut collection = Self {
            root,
            files: Vec::new(),
            index: HashMap::new(),
            sites: Vec::new(),
            conflicts: Vec::new(),
            platform,
            active_platforms,
            sites_changed: false,
            analyzer: None,
        };
        let site =
            collection.add_update_site(DEFAULT_UPDATE_SITE, MAIN_URL, None, None, timestamp);
        site.official = true;
        collection.sites_changed = false;
        collection
    }

    // ── Paths ───────────────────────────────────────────

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn prefix_update(&self, path: &str) -> PathBuf {
        self.prefix(&format!("update/{path}"))
    }

    pub fn file_exists(&self, filename: &str) -> bool {
        self.prefix(filename).exists()
    }

    // ── Record storage ──────────────────────────────────

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear_files(&mut self) {
        self.files.clear();
        self.index.clear();
    }

    pub fn add(&mut self, file: FileRecord) {
        let key = file.filename_stripped();
        match self.index.get(&key) {
            Some(&idx) => self.files[idx] = file,
            None => {
                self.index.insert(key, self.files.len());
                self.files.push(file);
            }
        }
    }

    pub fn get(&self, filename: &str) -> Option<&FileRecord> {
        let key = util::strip_filename_version(filename);
        self.index.get(&key).map(|&idx| &self.files[idx])
    }

    pub fn get_mut(&mut self, filename: &str) -> Option<&mut FileRecord> {
        let key = util::strip_filename_version(filename);
        match self.index.get(&key) {
            Some(&idx) => Some(&mut self.files[idx]),
            None => None,
        }
    }

    pub fn remove(&mut self, filename: &str) -> Option<FileRecord> {
        let key = util::strip_filename_version(filename);
        let idx = self.index.remove(&key)?;
        let removed = self.files.remove(idx);
        self.reindex();
        Some(removed)
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (idx, file) in self.files.iter().enumerate() {
            self.index.insert(file.filename_stripped(), idx);
        }
    }

    fn index_of(&self, filename: &str) -> UpdaterResult<usize> {
        let key = util::strip_filename_version(filename);
        self.index
            .get(&key)
            .copied()
            .ok_or_else(|| UpdaterError::UnknownFile(filename.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileRecord> {
        self.files.iter_mut()
    }

    /// Keys of all records matching a predicate; for loops that mutate.
    pub fn keys_where(&self, predicate: impl Fn(&FileRecord) -> bool) -> Vec<String> {
        self.files
            .iter()
            .filter(|file| predicate(file))
            .map(|file| file.filename_stripped())
            .collect()
    }

    /// Order records so the application bundle and core directories come
    /// first, then everything else lexicographically.
    pub fn sort(&mut self) {
        const PRECEDENCE: &[&str] = &[
            "Contents/", "spectra-", "Spectra", "config/", "jars/", "plugins/", "scripts/",
            "macros/",
        ];
        fn rank(filename: &str) -> usize {
            PRECEDENCE
                .iter()
                .position(|prefix| filename.starts_with(prefix))
                .unwrap_or(PRECEDENCE.len())
        }
        self.files.sort_by(|a, b| {
            rank(&a.filename)
                .cmp(&rank(&b.filename))
                .then_with(|| a.filename.cmp(&b.filename))
        });
        self.reindex();
    }

    /// A collection holding clones of the named records, with the same root
    /// and site table. Used to serialize per-site catalog variants.
    pub fn subset(&self, records: Vec<FileRecord>) -> FilesCollection {
        let mut result = FilesCollection {
            root: self.root.clone(),
            files: Vec::new(),
            index: HashMap::new(),
            sites: self.sites.clone(),
            conflicts: Vec::new(),
            platform: self.platform.clone(),
            active_platforms: self.active_platforms.clone(),
            sites_changed: false,
            analyzer: None,
        };
        for record in records {
            result.add(record);
        }
        result
    }

    // ── Platforms ───────────────────────────────────────

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn active_platforms(&self) -> &HashSet<String> {
        &self.active_platforms
    }

    pub fn set_active_platforms(&mut self, platforms: &[String]) {
        self.active_platforms.clear();
        for entry in platforms {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "all" {
                self.active_platforms.insert(self.platform.clone());
                for known in platform::known() {
                    self.active_platforms.insert((*known).to_string());
                }
            } else {
                self.active_platforms.insert(entry.to_string());
            }
        }
    }

    /// Platform filtering is disabled for developers: anyone holding upload
    /// rights sees every file.
    pub fn matches_platform(&self, file: &FileRecord) -> bool {
        self.has_uploadable_sites() || file.is_active_platform(&self.active_platforms)
    }

    // ── Sites ───────────────────────────────────────────

    pub fn add_update_site(
        &mut self,
        name: &str,
        url: &str,
        host: Option<String>,
        upload_directory: Option<String>,
        timestamp: u64,
    ) -> &mut UpdateSite {
        let mut site = UpdateSite::new(name, url, host, upload_directory, timestamp);
        site.active = true;
        self.add_site(site)
    }

    /// Insert or replace a site, preserving an existing site's rank and
    /// official flag.
    pub fn add_site(&mut self, mut site: UpdateSite) -> &mut UpdateSite {
        match self.sites.iter().position(|s| s.name == site.name) {
            Some(idx) => {
                site.rank = self.sites[idx].rank;
                site.official = self.sites[idx].official;
                self.sites[idx] = site;
                self.sites_changed = true;
                &mut self.sites[idx]
            }
            None => {
                site.rank = self.sites.len();
                self.sites.push(site);
                self.sites_changed = true;
                let last = self.sites.len() - 1;
                &mut self.sites[last]
            }
        }
    }

    pub fn get_site(&self, name: &str, even_disabled: bool) -> Option<&UpdateSite> {
        let site = self.sites.iter().find(|site| site.name == name)?;
        if even_disabled || site.active {
            Some(site)
        } else {
            None
        }
    }

    pub fn get_site_mut(&mut self, name: &str) -> Option<&mut UpdateSite> {
        self.sites.iter_mut().find(|site| site.name == name)
    }

    pub fn sites(&self, even_disabled: bool) -> impl Iterator<Item = &UpdateSite> {
        self.sites
            .iter()
            .filter(move |site| even_disabled || site.active)
    }

    pub fn site_names(&self, even_disabled: bool) -> Vec<String> {
        self.sites(even_disabled)
            .map(|site| site.name.clone())
            .collect()
    }

    pub fn site_rank(&self, name: &str) -> Option<usize> {
        self.get_site(name, true).map(|site| site.rank)
    }

    pub fn has_uploadable_sites(&self) -> bool {
        self.sites
            .iter()
            .any(|site| site.active && site.is_uploadable())
    }

    pub fn sites_changed(&self) -> bool {
        self.sites_changed
    }

    pub fn set_sites_changed(&mut self, changed: bool) {
        self.sites_changed = changed;
    }

    /// Sites with staged uploads or removals, in site order.
    pub fn site_names_to_upload(&self) -> Vec<String> {
        let mut wanted: HashSet<&str> = HashSet::new();
        for file in &self.files {
            if matches!(file.action(), Action::Upload | Action::Remove) {
                if let Some(site) = file.update_site.as_deref() {
                    wanted.insert(site);
                }
            }
        }
        self.site_names(false)
            .into_iter()
            .filter(|name| wanted.contains(name.as_str()))
            .collect()
    }

    pub fn remove_update_site(&mut self, name: &str) -> UpdaterResult<()> {
        if self.get_site(name, true).is_none() {
            return Err(UpdaterError::UnknownSite(name.to_string()));
        }
        for key in self.keys_where(|file| file.update_site.as_deref() == Some(name)) {
            self.remove_file_from_site(&key, name);
        }
        self.sites.retain(|site| site.name != name);
        for (rank, site) in self.sites.iter_mut().enumerate() {
            site.rank = rank;
        }
        self.sites_changed = true;
        Ok(())
    }

    /// Turn a site off without forgetting it. Returns the number of files
    /// that picked up an action as a result.
    pub fn deactivate_update_site(&mut self, name: &str) -> UpdaterResult<usize> {
        let site = self
            .get_site(name, true)
            .ok_or_else(|| UpdaterError::UnknownSite(name.to_string()))?;
        if !site.active {
            return Ok(0);
        }
        let keys = self.keys_where(|file| {
            self.matches_platform(file)
                && file.status() != Status::ObsoleteUninstalled
                && file.update_site.as_deref() == Some(name)
        });
        let count = keys.len();
        for key in keys {
            self.remove_file_from_site(&key, name);
        }
        if let Some(site) = self.get_site_mut(name) {
            site.active = false;
        }
        self.sites_changed = true;
        Ok(count)
    }

    /// Detach one record from a site: drop it, promote its highest-priority
    /// shadowed entry, or mark the orphaned local copy obsolete.
    fn remove_file_from_site(&mut self, key: &str, site_name: &str) {
        let Ok(idx) = self.index_of(key) else {
            return;
        };
        if self.files[idx].update_site.as_deref() != Some(site_name) {
            return;
        }
        let status = self.files[idx].status();
        if status == Status::LocalOnly {
            return;
        }
        let not_installed = matches!(
            status,
            Status::New | Status::NotInstalled | Status::ObsoleteUninstalled
        );

        let mut record = self.files.remove(idx);
        self.reindex();

        let overridden = record.overridden_sites.pop();
        match overridden {
            None => {
                if not_installed {
                    return;
                }
                record.set_status(Status::Obsolete);
                record.force_action(Action::Uninstall);
                self.add(record);
            }
            Some((_, mut promoted)) => {
                // Remaining shadows travel with the promoted record, and so
                // does the local state the winner accumulated.
                let shadows: Vec<(String, FileRecord)> =
                    record.overridden_sites.drain(..).collect();
                for (shadow_site, shadow) in shadows {
                    promoted.add_overridden_site(shadow_site, shadow);
                }
                let same_version = record.checksum() == promoted.checksum()
                    && record.filename == promoted.filename;
                let old_filename = record.filename.clone();
                let local_filename = record.local_filename.clone();
                let local_checksum = record.local_checksum.clone();
                let local_timestamp = record.local_timestamp;
                promoted.add_overridden_site(site_name.to_string(), record);
                promoted.prune_self_shadow();
                if same_version {
                    promoted.set_status(Status::Installed);
                } else if promoted.current.is_some() {
                    // The installed version is the removed site's; it shows
                    // through the shadow history, making this an update.
                    match (&local_filename, &local_checksum) {
                        (Some(name), Some(checksum)) => {
                            promoted.set_local_version(name, checksum, local_timestamp);
                        }
                        _ => promoted.set_status(Status::Modified),
                    }
                    promoted.force_action(Action::Update);
                    if old_filename != promoted.filename {
                        if let Err(error) = util::touch(&self.prefix_update(&old_filename)) {
                            warn!("Cannot stage '{old_filename}' for uninstall: {error}");
                        }
                    }
                } else {
                    promoted.set_status(Status::Obsolete);
                    promoted.force_action(Action::Uninstall);
                    promoted.filename = old_filename;
                }
                self.add(promoted);
            }
        }
    }

    // ── Actions ─────────────────────────────────────────

    /// Request an action, validating it against the status table. Outside
    /// the table, `Remove` is permitted on shadowing entries and `Upload` on
    /// records whose local copy carries a different (versioned) name.
    pub fn set_action(&mut self, filename: &str, action: Action) -> UpdaterResult<()> {
        let idx = self.index_of(filename)?;
        {
            let file = &self.files[idx];
            let escape_hatch = (action == Action::Remove && file.overrides_other_site())
                || (action == Action::Upload
                    && file
                        .local_filename
                        .as_deref()
                        .is_some_and(|local| local != file.filename));
            if !file.status().is_valid(action) && !escape_hatch {
                return Err(UpdaterError::InvalidAction {
                    filename: file.filename.clone(),
                    action: action.to_string(),
                    status: file.status().to_string(),
                });
            }
        }

        if action == Action::Upload {
            let upload_sites = self.site_names_to_upload();
            let file = &mut self.files[idx];
            if file.current.is_none() {
                let checksum = file.local_checksum.clone().ok_or_else(|| {
                    UpdaterError::Other(format!("No local copy of {} to upload", file.filename))
                })?;
                file.current = Some(Version::new(checksum, file.local_timestamp));
            }
            if let Some(local) = file.local_filename.clone() {
                if local != file.filename {
                    let logical = file.filename.clone();
                    if let Some(current) = &mut file.current {
                        current.filename = Some(logical);
                    }
                    file.filename = local;
                }
            }
            if file.update_site.is_none() {
                if upload_sites.len() != 1 {
                    return Err(UpdaterError::Other(
                        "Need an update site to upload to!".to_string(),
                    ));
                }
                file.update_site = Some(upload_sites[0].clone());
            }
            self.update_dependencies(idx);
        } else if action != Action::Remove {
            let file = &mut self.files[idx];
            if let Some(original) = file.original_update_site.take() {
                file.update_site = Some(original);
            }
        }
        self.files[idx].force_action(action);
        Ok(())
    }

    /// Adopt the first action from the preference list that the current
    /// status allows. Returns whether any was applicable.
    pub fn set_first_valid_action(
        &mut self,
        filename: &str,
        actions: &[Action],
    ) -> UpdaterResult<bool> {
        let idx = self.index_of(filename)?;
        for action in actions {
            if self.files[idx].status().is_valid(*action) {
                self.set_action(filename, *action)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Dependency closure ──────────────────────────────

    /// Keys of the files this record depends on, skipping unknown and
    /// obsolete entries; with `recursive`, the full transitive closure
    /// including the record itself.
    pub fn file_dependencies(&self, filename: &str, recursive: bool) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        let Some(start) = self.get(filename) else {
            return result;
        };
        if recursive {
            result.push(start.filename_stripped());
        }
        let mut stack = vec![start];
        while let Some(file) = stack.pop() {
            for dependency in &file.dependencies {
                let Some(dep) = self.get(&dependency.filename) else {
                    continue;
                };
                if dep.is_obsolete() {
                    continue;
                }
                let key = dep.filename_stripped();
                if result.contains(&key) {
                    continue;
                }
                result.push(key);
                if recursive {
                    stack.push(dep);
                }
            }
        }
        result
    }

    /// dependency key → keys of the staged files that need it.
    pub fn dependencees(
        &self,
        files: &[String],
        overriding: bool,
    ) -> Vec<(String, Vec<String>)> {
        let mut map: Vec<(String, Vec<String>)> = Vec::new();
        for key in files {
            self.add_dependencees(key, &mut map, overriding, &mut HashSet::new());
        }
        map
    }

    fn add_dependencees(
        &self,
        key: &str,
        map: &mut Vec<(String, Vec<String>)>,
        overriding: bool,
        visiting: &mut HashSet<String>,
    ) {
        if !visiting.insert(key.to_string()) {
            return;
        }
        let Some(file) = self.get(key) else {
            return;
        };
        for dependency in &file.dependencies {
            let Some(other) = self.get(&dependency.filename) else {
                continue;
            };
            if overriding != dependency.overrides || !self.matches_platform(other) {
                continue;
            }
            if other.is_obsolete() && other.will_not_be_installed() {
                debug!(
                    "Ignoring obsolete dependency {} of {}",
                    dependency.filename, file.filename
                );
                continue;
            }
            if dependency.overrides {
                if other.will_not_be_installed() {
                    continue;
                }
            } else if other.will_be_up_to_date() {
                continue;
            }
            let other_key = other.filename_stripped();
            if let Some((_, dependencees)) =
                map.iter_mut().find(|(name, _)| *name == other_key)
            {
                if !dependencees.contains(&key.to_string()) {
                    dependencees.push(key.to_string());
                }
                continue;
            }
            map.push((other_key.clone(), vec![key.to_string()]));
            // overriding dependencies are not recursive
            if !overriding {
                self.add_dependencees(&other_key, map, overriding, visiting);
            }
        }
    }

    /// Re-derive the dependency list of an archive from its class references.
    fn update_dependencies(&mut self, idx: usize) {
        if self.analyzer.is_none() {
            match DependencyAnalyzer::new(&self.root) {
                Ok(analyzer) => self.analyzer = Some(analyzer),
                Err(error) => {
                    warn!("Could not index installed archives: {error}");
                    return;
                }
            }
        }
        let Some(analyzer) = self.analyzer.take() else {
            return;
        };
        let record = &self.files[idx];
        match analyzer.dependencies(&self.root, record) {
            Ok(Some(dependencies)) => {
                let stamped: Vec<(String, u64)> = dependencies
                    .into_iter()
                    .map(|dep| {
                        let timestamp =
                            util::file_timestamp(&self.prefix(&dep)).unwrap_or(0);
                        (dep, timestamp)
                    })
                    .collect();
                let record = &mut self.files[idx];
                for (dep, timestamp) in stamped {
                    record.add_dependency(Dependency::new(dep, timestamp, false));
                }
            }
            Ok(None) => {}
            Err(error) => warn!(
                "Could not analyze dependencies of {}: {error}",
                self.files[idx].filename
            ),
        }
        self.analyzer = Some(analyzer);
    }

    // ── Staging ─────────────────────────────────────────

    /// Stage a file and its transitive dependencies for update/install.
    /// Locally modified files are skipped unless forced.
    pub fn stage_for_update(&mut self, filename: &str, even_forced: bool) -> UpdaterResult<bool> {
        let idx = self.index_of(filename)?;
        if !even_forced && self.files[idx].status() == Status::Modified {
            return Ok(false);
        }
        if !self.set_first_valid_action(filename, &[Action::Update, Action::Install])? {
            return Ok(false);
        }
        for dep_key in self.file_dependencies(filename, true) {
            if let Some(dep) = self.get(&dep_key) {
                if !even_forced
                    && matches!(dep.status(), Status::Modified | Status::ObsoleteModified)
                {
                    continue;
                }
            }
            self.set_first_valid_action(&dep_key, &[Action::Update, Action::Install])?;
        }
        Ok(true)
    }

    /// Stage a file for uninstall: jar deletions become zero-length
    /// placeholders under `update/`; launchers are sidestepped to `.old`
    /// immediately so a running binary keeps its image.
    pub fn stage_for_uninstall(&mut self, filename: &str) -> UpdaterResult<()> {
        let idx = self.index_of(filename)?;
        let local_name = self.files[idx].local_filename_or_default().to_string();
        if self.files[idx].action() != Action::Uninstall {
            self.set_action(filename, Action::Uninstall)?;
        }
        if local_name.ends_with(".jar") {
            util::touch(&self.prefix_update(&local_name))?;
        } else {
            let mut old = format!("{local_name}.old");
            if old.ends_with(".exe.old") {
                old = format!("{}.old.exe", &old[..old.len() - 8]);
            }
            if let Err(error) = std::fs::rename(self.prefix(&local_name), self.prefix(&old)) {
                debug!("Could not sidestep {local_name}: {error}");
            }
            util::touch(&self.prefix_update(&old))?;
        }
        let file = &mut self.files[idx];
        if file.status() != Status::LocalOnly {
            let demoted = if file.is_obsolete() {
                Status::ObsoleteUninstalled
            } else {
                Status::NotInstalled
            };
            file.set_status(demoted);
            file.force_action(Action::Uninstall);
        }
        Ok(())
    }

    /// Stage a file for upload to the given site, retargeting co-site
    /// dependency entries when the upload carries a versioned rename.
    pub fn stage_for_upload(&mut self, filename: &str, site: &str) -> UpdaterResult<()> {
        let idx = self.index_of(filename)?;
        {
            let file = &mut self.files[idx];
            if file.status() == Status::LocalOnly {
                if let Some(current) = &file.current {
                    file.local_checksum = Some(current.checksum.clone());
                    file.local_timestamp = current.timestamp;
                }
            }
            file.update_site = Some(site.to_string());
        }
        if self.files[idx].status() == Status::NotInstalled {
            self.set_action(filename, Action::Remove)?;
        } else {
            self.set_action(filename, Action::Upload)?;
        }

        let uploaded_name = self.files[idx].filename.clone();
        let uploaded_key = util::strip_filename_version(&uploaded_name);
        for other_idx in 0..self.files.len() {
            if other_idx == idx
                || self.files[other_idx].update_site.as_deref() != Some(site)
                || self.files[other_idx].is_obsolete()
            {
                continue;
            }
            for dep in &mut self.files[other_idx].dependencies {
                if dep.overrides {
                    continue;
                }
                if dep.filename != uploaded_name
                    && util::strip_filename_version(&dep.filename) == uploaded_key
                {
                    dep.filename = uploaded_name.clone();
                }
            }
        }
        Ok(())
    }

    /// A file was removed from its last owning site: demote the history and
    /// hand ownership to the highest-ranked non-obsolete shadowed entry.
    pub fn mark_removed(&mut self, filename: &str) -> UpdaterResult<()> {
        let idx = self.index_of(filename)?;
        let mut record = self.files.remove(idx);
        self.reindex();

        let mut overriding: Option<usize> = None;
        let mut overriding_rank = 0usize;
        for (pos, (site_name, shadowed)) in record.overridden_sites.iter().enumerate() {
            if shadowed.is_obsolete() {
                continue;
            }
            let rank = self.site_rank(site_name).unwrap_or(0);
            if overriding.is_none() || rank > overriding_rank {
                overriding = Some(pos);
                overriding_rank = rank;
            }
        }

        if let Some(mut current) = record.current.take() {
            current.timestamp_obsolete = util::current_timestamp();
            record.add_previous_version(current);
        }
        record.set_status(Status::ObsoleteUninstalled);

        match overriding {
            None => self.add(record),
            Some(pos) => {
                let (_, mut promoted) = record.overridden_sites.remove(pos);
                let shadows: Vec<(String, FileRecord)> =
                    record.overridden_sites.drain(..).collect();
                for (shadow_site, shadow) in shadows {
                    promoted.add_overridden_site(shadow_site, shadow);
                }
                if let Some(site) = record.update_site.clone() {
                    promoted.add_overridden_site(site, record);
                }
                promoted.prune_self_shadow();
                self.add(promoted);
            }
        }
        Ok(())
    }

    // ── Filters ─────────────────────────────────────────

    pub fn filter_by_action(&self, action: Action) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(move |file| file.action() == action)
    }

    pub fn to_install_or_update(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|file| file.to_install_or_update())
    }

    pub fn to_uninstall(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|file| file.to_uninstall())
    }

    pub fn to_upload(&self, site: Option<&str>) -> impl Iterator<Item = &FileRecord> + '_ {
        let site = site.map(String::from);
        self.files.iter().filter(move |file| {
            file.to_upload()
                && site
                    .as_deref()
                    .map_or(true, |name| file.update_site.as_deref() == Some(name))
        })
    }

    pub fn to_remove(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|file| file.to_remove())
    }

    pub fn up_to_date(&self) -> impl Iterator<Item = &FileRecord> {
        self.files
            .iter()
            .filter(|file| file.action() == Action::Installed)
    }

    pub fn changes(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|file| file.action_specified())
    }

    pub fn has_changes(&self) -> bool {
        self.changes().next().is_some()
    }

    pub fn has_upload_or_remove(&self) -> bool {
        self.files
            .iter()
            .any(|file| matches!(file.action(), Action::Upload | Action::Remove))
    }

    pub fn installed(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|file| {
            !matches!(file.status(), Status::LocalOnly | Status::NotInstalled)
        })
    }

    /// Records of one site, platform-filtered. With `include_obsoletes`,
    /// shadowed records belonging to the site are included too.
    pub fn for_update_site(&self, name: &str, include_obsoletes: bool) -> Vec<&FileRecord> {
        let mut result = Vec::new();
        for file in &self.files {
            let matches = self.matches_platform(file)
                && file.update_site.as_deref() == Some(name)
                && (include_obsoletes || file.status() != Status::ObsoleteUninstalled);
            if matches {
                result.push(file);
            } else if include_obsoletes {
                if let Some(overridden) = file.overridden_site(name) {
                    result.push(overridden);
                }
            }
        }
        result
    }

    pub fn updateable(&self, even_forced: bool) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(move |file| {
            file.is_updateable(even_forced) && self.matches_platform(file)
        })
    }

    pub fn mark_for_update(&mut self, even_forced: bool) -> UpdaterResult<()> {
        let keys = self.keys_where(|file| {
            file.is_updateable(even_forced) && self.matches_platform(file)
        });
        for key in keys {
            self.set_first_valid_action(
                &key,
                &[Action::Update, Action::Uninstall, Action::Install],
            )?;
        }
        Ok(())
    }

    /// After re-activating a site, pick up everything it can install.
    pub fn mark_site_for_update(&mut self, site: &str, even_forced: bool) -> UpdaterResult<()> {
        let keys = self.keys_where(|file| {
            file.update_site.as_deref() == Some(site)
                && self.matches_platform(file)
                && file.status() != Status::ObsoleteUninstalled
                && (file.is_updateable(even_forced) || file.status().is_valid(Action::Install))
                && file.is_active_platform(&self.active_platforms)
        });
        for key in keys {
            self.set_first_valid_action(
                &key,
                &[Action::Update, Action::Uninstall, Action::Install],
            )?;
        }
        Ok(())
    }

    // ── URLs ────────────────────────────────────────────

    pub fn update_url(&self, file: &FileRecord) -> Option<String> {
        let site_name = file.update_site.as_deref()?;
        let site = self.get_site(site_name, false)?;
        Some(util::versioned_url(site.url(), &file.filename, file.timestamp()))
    }

    // ── Consistency ─────────────────────────────────────

    /// A cycle among the given site's dependency edges, rendered as
    /// `a -> b -> a`. Files staged for removal are not edges.
    pub fn find_dependency_cycle(&self, site: Option<&str>) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        fn visit(
            collection: &FilesCollection,
            key: &str,
            site: Option<&str>,
            marks: &mut HashMap<String, Mark>,
            chain: &mut Vec<String>,
        ) -> Option<String> {
            match marks.get(key).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return None,
                Mark::InProgress => {
                    let start = chain.iter().position(|name| name == key)?;
                    let mut cycle: Vec<&str> =
                        chain[start..].iter().map(String::as_str).collect();
                    cycle.push(key);
                    return Some(cycle.join(" -> "));
                }
                Mark::Unvisited => {}
            }
            marks.insert(key.to_string(), Mark::InProgress);
            chain.push(key.to_string());
            let file = collection.get(key);
            if let Some(file) = file {
                for dependency in &file.dependencies {
                    let Some(dep) = collection.get(&dependency.filename) else {
                        continue;
                    };
                    if site.is_some() && dep.update_site.as_deref() != site {
                        continue;
                    }
                    if dep.action() == Action::Remove {
                        continue;
                    }
                    if let Some(cycle) =
                        visit(collection, &dep.filename_stripped(), site, marks, chain)
                    {
                        return Some(cycle);
                    }
                }
            }
            chain.pop();
            marks.insert(key.to_string(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for file in &self.files {
            if site.is_some() && file.update_site.as_deref() != site {
                continue;
            }
            if file.action() == Action::Remove {
                continue;
            }
            let mut chain = Vec::new();
            if let Some(cycle) =
                visit(self, &file.filename_stripped(), site, &mut marks, &mut chain)
            {
                return Some(cycle);
            }
        }
        None
    }

    /// Null when consistent; otherwise a report of every violation.
    pub fn check_consistency(&self) -> Option<String> {
        let upload_sites = self.site_names_to_upload();
        let upload_site = upload_sites.first().map(String::as_str);
        let mut result = String::new();

        if let Some(cycle) = self.find_dependency_cycle(upload_site) {
            result.push_str(&format!("Circular dependency detected: {cycle}\n"));
        }
        for file in &self.files {
            if upload_site.is_some_and(|site| file.update_site.as_deref() != Some(site))
                || file.action() == Action::Remove
            {
                continue;
            }
            // only non-obsolete components can have dependencies
            if !file.dependencies.is_empty()
                && file.is_obsolete()
                && file.action() != Action::Upload
            {
                result.push_str(&format!(
                    "Obsolete file {} has dependencies: {}!\n",
                    file,
                    util::join(", ", file.dependencies.iter())
                ));
            }
            for dependency in &file.dependencies {
                let dep = self.get(&dependency.filename);
                if dep.is_none() || dep.is_some_and(|dep| dep.current.is_none()) {
                    result.push_str(&format!(
                        "The file {} has the obsolete/local-only dependency {}!\n",
                        file, dependency.filename
                    ));
                }
            }
        }
        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> FilesCollection {
        FilesCollection::new(std::env::temp_dir().join("spectra-collection-test"))
    }

    fn remote_file(site: &str, name: &str, checksum: &str) -> FileRecord {
        FileRecord::new(
            Some(site.into()),
            name,
            10,
            Some(checksum.into()),
            20240101000000,
            Status::NotInstalled,
        )
    }

    #[test]
    fn lookup_strips_versions() {
        let mut files = collection();
        files.add(remote_file("Spectra", "jars/engine.jar", "aaaa"));
        assert!(files.get("jars/engine-1.2.3.jar").is_some());
        assert!(files.get("jars/other.jar").is_none());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut files = collection();
        files.add(remote_file("Spectra", "jars/zz.jar", "aaaa"));
        files.add(remote_file("Spectra", "jars/aa.jar", "bbbb"));
        let names: Vec<&str> = files.iter().map(|file| file.filename.as_str()).collect();
        assert_eq!(names, ["jars/zz.jar", "jars/aa.jar"]);
    }

    #[test]
    fn default_site_is_registered() {
        let files = collection();
        assert!(files.get_site(DEFAULT_UPDATE_SITE, false).is_some());
        assert_eq!(files.site_rank(DEFAULT_UPDATE_SITE), Some(0));
    }

    #[test]
    fn site_ranks_follow_insertion() {
        let mut files = collection();
        files.add_update_site("Extras", "https://extras.example/", None, None, 0);
        assert_eq!(files.site_rank("Extras"), Some(1));
        // Re-adding keeps the original rank.
        files.add_update_site("Extras", "https://elsewhere.example/", None, None, 0);
        assert_eq!(files.site_rank("Extras"), Some(1));
    }

    #[test]
    fn invalid_action_is_rejected() {
        let mut files = collection();
        files.add(remote_file("Spectra", "jars/engine.jar", "aaaa"));
        let error = files
            .set_action("jars/engine.jar", Action::Uninstall)
            .unwrap_err();
        assert_eq!(error.kind(), "invalid-action");
    }

    #[test]
    fn install_cascades_to_dependencies() {
        let mut files = collection();
        let mut top = remote_file("Spectra", "jars/top.jar", "aaaa");
        top.add_dependency(Dependency::new("jars/lib.jar", 20240101000000, false));
        files.add(top);
        files.add(remote_file("Spectra", "jars/lib.jar", "bbbb"));

        assert!(files.stage_for_update("jars/top.jar", false).unwrap());
        assert_eq!(
            files.get("jars/lib.jar").unwrap().action(),
            Action::Install
        );
    }

    #[test]
    fn overriding_dependencies_are_not_chased() {
        let mut files = collection();
        let mut top = remote_file("Spectra", "jars/top.jar", "aaaa");
        top.add_dependency(Dependency::new("jars/shadow.jar", 20240101000000, true));
        files.add(top);
        files.add(remote_file("Spectra", "jars/shadow.jar", "bbbb"));

        files.stage_for_update("jars/top.jar", false).unwrap();
        let map = files.dependencees(&["jars/top.jar".to_string()], false);
        assert!(map.iter().all(|(name, _)| name != "jars/shadow.jar"));
    }

    #[test]
    fn cycle_detection_reports_the_path() {
        let mut files = collection();
        let mut a = remote_file("Spectra", "jars/a.jar", "aaaa");
        a.add_dependency(Dependency::new("jars/b.jar", 0, false));
        let mut b = remote_file("Spectra", "jars/b.jar", "bbbb");
        b.add_dependency(Dependency::new("jars/a.jar", 0, false));
        files.add(a);
        files.add(b);

        let cycle = files.find_dependency_cycle(Some("Spectra")).unwrap();
        assert!(
            cycle.contains("jars/a.jar -> jars/b.jar -> jars/a.jar")
                || cycle.contains("jars/b.jar -> jars/a.jar -> jars/b.jar"),
            "unexpected cycle: {cycle}"
        );
    }

    #[test]
    fn consistency_flags_missing_dependencies() {
        let mut files = collection();
        let mut top = remote_file("Spectra", "jars/top.jar", "aaaa");
        top.add_dependency(Dependency::new("jars/gone.jar", 0, false));
        files.add(top);
        let report = files.check_consistency().unwrap();
        assert!(report.contains("jars/gone.jar"));
    }

    #[test]
    fn upload_site_selection_requires_single_site() {
        let mut files = collection();
        let mut local = FileRecord::new(
            None,
            "macros/mine.ijm",
            5,
            Some("abcd".into()),
            20240101000000,
            Status::LocalOnly,
        );
        local.local_filename = Some("macros/mine.ijm".into());
        local.local_checksum = Some("abcd".into());
        local.local_timestamp = 20240101000000;
        files.add(local);
        // No staged uploads anywhere: the site cannot be inferred.
        let error = files.set_action("macros/mine.ijm", Action::Upload).unwrap_err();
        assert_eq!(error.kind(), "generic");
    }
}
