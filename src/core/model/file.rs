use std::collections::HashSet;

use super::{Action, Dependency, Status, Version};
use crate::core::util;

/// A tracked artifact.
///
/// The logical `filename` (with the version suffix stripped) is the stable
/// identity; `local_filename` is what actually sits on disk, which may carry
/// a different version suffix. When several sites claim the same logical
/// name, the losers are preserved in `overridden_sites` so deactivating the
/// winner can fall back to them.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub update_site: Option<String>,
    pub original_update_site: Option<String>,
    pub filename: String,
    pub description: Option<String>,
    pub executable: bool,
    pub current: Option<Version>,
    pub previous: Vec<Version>,
    pub filesize: u64,
    pub metadata_changed: bool,

    pub local_filename: Option<String>,
    pub local_checksum: Option<String>,
    pub local_timestamp: u64,

    pub dependencies: Vec<Dependency>,
    pub links: Vec<String>,
    pub authors: Vec<String>,
    pub platforms: Vec<String>,
    pub categories: Vec<String>,

    /// site name → the record that site advertised, insertion-ordered.
    pub overridden_sites: Vec<(String, FileRecord)>,

    status: Status,
    action: Action,
}

impl FileRecord {
    pub fn new(
        update_site: Option<String>,
        filename: impl Into<String>,
        filesize: u64,
        checksum: Option<String>,
        timestamp: u64,
        status: Status,
    ) -> Self {
        Self {
            update_site,
            original_update_site: None,
            filename: filename.into(),
            description: None,
            executable: false,
            current: checksum.map(|sum| Version::new(sum, timestamp)),
            previous: Vec::new(),
            filesize,
            metadata_changed: false,
            local_filename: None,
            local_checksum: None,
            local_timestamp: 0,
            dependencies: Vec::new(),
            links: Vec::new(),
            authors: Vec::new(),
            platforms: Vec::new(),
            categories: Vec::new(),
            overridden_sites: Vec::new(),
            status,
            action: status.no_action(),
        }
    }

    // ── Identity ────────────────────────────────────────

    pub fn filename_stripped(&self) -> String {
        util::strip_filename_version(&self.filename)
    }

    pub fn base_name(&self) -> String {
        let stripped = self.filename_stripped();
        stripped
            .strip_suffix(".jar")
            .map(String::from)
            .unwrap_or(stripped)
    }

    pub fn local_filename_for_display(&self) -> String {
        match &self.local_filename {
            Some(local) if *local != self.filename => {
                format!("{} (local: {})", self.filename, local)
            }
            _ => self.filename.clone(),
        }
    }

    /// The on-disk name, falling back to the logical name.
    pub fn local_filename_or_default(&self) -> &str {
        self.local_filename.as_deref().unwrap_or(&self.filename)
    }

    /// The filename this record had at the given date.
    pub fn filename_at(&self, timestamp: u64) -> Option<&str> {
        if let Some(current) = &self.current {
            if timestamp >= current.timestamp {
                return Some(&self.filename);
            }
        }
        let mut result = None;
        let mut matched = 0;
        for version in &self.previous {
            if timestamp >= version.timestamp && version.timestamp > matched {
                result = version.filename.as_deref();
                matched = version.timestamp;
            }
        }
        result
    }

    // ── Status / action ─────────────────────────────────

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.set_no_action();
    }

    pub fn set_no_action(&mut self) {
        self.action = self.status.no_action();
    }

    /// Force the action without collection-level validation. Callers go
    /// through `FilesCollection::set_action` unless the transition was
    /// already validated.
    pub(crate) fn force_action(&mut self, action: Action) {
        self.action = action;
    }

    pub fn action_specified(&self) -> bool {
        self.action != self.status.no_action()
    }

    pub fn is_obsolete(&self) -> bool {
        self.status.is_obsolete()
    }

    pub fn is_local_only(&self) -> bool {
        self.status == Status::LocalOnly
    }

    pub fn is_locally_modified(&self) -> bool {
        self.status.no_action() == Action::Modified
    }

    pub fn to_update(&self) -> bool {
        self.action == Action::Update
    }

    pub fn to_uninstall(&self) -> bool {
        self.action == Action::Uninstall
    }

    pub fn to_install(&self) -> bool {
        self.action == Action::Install
    }

    pub fn to_upload(&self) -> bool {
        self.action == Action::Upload
    }

    pub fn to_remove(&self) -> bool {
        self.action == Action::Remove
    }

    pub fn to_install_or_update(&self) -> bool {
        matches!(self.action, Action::Install | Action::Update)
    }

    /// True when the chosen action leaves no installed copy behind.
    pub fn will_not_be_installed(&self) -> bool {
        matches!(
            self.action,
            Action::NotInstalled | Action::New | Action::Uninstall | Action::Remove
        )
    }

    /// True when the chosen action ends with the current version on disk.
    pub fn will_be_up_to_date(&self) -> bool {
        matches!(
            self.action,
            Action::Installed
                | Action::Install
                | Action::Update
                | Action::Upload
                | Action::LocalOnly
        )
    }

    /// Does this file want (or could it be forced) to move to the current
    /// version?
    pub fn is_updateable(&self, even_forced: bool) -> bool {
        self.action == Action::Update
            || self.action == Action::Install
            || self.status == Status::Updateable
            || self.status == Status::Obsolete
            || (even_forced
                && (self.status.is_valid(Action::Update) || self.status == Status::ObsoleteModified))
    }

    // ── Versions ────────────────────────────────────────

    /// Is the checksum known to this record, as current, as a previous
    /// version, or through any shadowed per-site record?
    pub fn has_previous_version(&self, checksum: &str) -> bool {
        if let Some(current) = &self.current {
            if current.checksum == checksum {
                return true;
            }
        }
        if self.previous.iter().any(|version| version.checksum == checksum) {
            return true;
        }
        self.overridden_sites
            .iter()
            .any(|(_, record)| record.has_previous_version(checksum))
    }

    pub fn add_previous_version(&mut self, version: Version) {
        if !self.previous.contains(&version) {
            self.previous.push(version);
        }
    }

    /// Demote the current version and promote a new one.
    pub fn set_version(&mut self, checksum: impl Into<String>, timestamp: u64) {
        if let Some(current) = self.current.take() {
            self.add_previous_version(current);
        }
        let mut version = Version::new(checksum, timestamp);
        version.filename = Some(self.filename.clone());
        self.current = Some(version);
    }

    /// Record what the scanner found on disk and derive the status.
    pub fn set_local_version(&mut self, filename: &str, checksum: &str, timestamp: u64) {
        if filename != self.filename {
            self.metadata_changed = true;
        }
        self.local_filename = Some(filename.to_string());
        self.local_checksum = Some(checksum.to_string());
        self.local_timestamp = timestamp;

        if let Some(current) = &self.current {
            if current.checksum == checksum {
                if self.status != Status::LocalOnly {
                    self.status = Status::Installed;
                }
                self.set_no_action();
                return;
            }
        }
        self.status = if self.has_previous_version(checksum) {
            if self.current.is_none() {
                Status::Obsolete
            } else {
                Status::Updateable
            }
        } else if self.current.is_none() {
            Status::ObsoleteModified
        } else {
            Status::Modified
        };
        self.set_no_action();
    }

    pub fn is_newer_than(&self, timestamp: u64) -> bool {
        if let Some(current) = &self.current {
            if current.timestamp <= timestamp {
                return false;
            }
        }
        self.previous.iter().all(|version| version.timestamp > timestamp)
    }

    /// The checksum this record advertises, respecting the chosen action.
    pub fn checksum(&self) -> Option<&str> {
        match self.action {
            Action::Upload => self.local_checksum.as_deref(),
            Action::Remove => None,
            _ => self.current.as_ref().map(|version| version.checksum.as_str()),
        }
    }

    /// The timestamp this record advertises, respecting the chosen action.
    pub fn timestamp(&self) -> u64 {
        match self.action {
            Action::Upload => {
                if self.status == Status::LocalOnly {
                    self.current
                        .as_ref()
                        .map(|version| version.timestamp)
                        .unwrap_or(self.local_timestamp)
                } else {
                    self.local_timestamp
                }
            }
            Action::Remove => 0,
            _ => self
                .current
                .as_ref()
                .map(|version| version.timestamp)
                .unwrap_or(0),
        }
    }

    // ── Metadata ────────────────────────────────────────

    pub fn add_platform(&mut self, platform: &str) {
        // "linux" is the pre-64-bit-era tag.
        let platform = if platform == "linux" { "linux32" } else { platform.trim() };
        if !platform.is_empty() && !self.platforms.iter().any(|p| p == platform) {
            self.platforms.push(platform.to_string());
        }
    }

    pub fn add_category(&mut self, category: &str) {
        let category = category.trim();
        if !category.is_empty() && !self.categories.iter().any(|c| c == category) {
            self.categories.push(category.to_string());
        }
    }

    pub fn add_link(&mut self, link: &str) {
        if !self.links.iter().any(|l| l == link) {
            self.links.push(link.to_string());
        }
    }

    pub fn add_author(&mut self, author: &str) {
        if !self.authors.iter().any(|a| a == author) {
            self.authors.push(author.to_string());
        }
    }

    /// Fill unset metadata from another record.
    pub fn complete_metadata_from(&mut self, other: &FileRecord) {
        if self.description.as_deref().unwrap_or("").is_empty() {
            self.description = other.description.clone();
        }
        if self.links.is_empty() {
            self.links = other.links.clone();
        }
        if self.authors.is_empty() {
            self.authors = other.authors.clone();
        }
        if self.platforms.is_empty() {
            self.platforms = other.platforms.clone();
        }
        if self.categories.is_empty() {
            self.categories = other.categories.clone();
        }
    }

    // ── Dependencies ────────────────────────────────────

    pub fn add_dependency(&mut self, dependency: Dependency) {
        if dependency.filename.trim().is_empty() {
            return;
        }
        let key = util::strip_filename_version(&dependency.filename);
        if let Some(existing) = self
            .dependencies
            .iter_mut()
            .find(|dep| dep.filename == key)
        {
            // the timestamp should not be changed unnecessarily
            if existing.filename == dependency.filename
                || existing.timestamp >= dependency.timestamp
            {
                return;
            }
            existing.timestamp = dependency.timestamp;
            existing.overrides = dependency.overrides;
            return;
        }
        self.dependencies.push(Dependency {
            filename: key,
            ..dependency
        });
    }

    pub fn remove_dependency(&mut self, filename: &str) {
        let key = util::strip_filename_version(filename);
        self.dependencies.retain(|dep| dep.filename != key);
    }

    pub fn has_dependency(&self, filename: &str) -> bool {
        let key = util::strip_filename_version(filename);
        self.dependencies.iter().any(|dep| dep.filename == key)
    }

    // ── Platforms ───────────────────────────────────────

    pub fn is_for_platform(&self, platform: &str) -> bool {
        self.platforms.iter().any(|p| p == platform)
    }

    /// A file applies to a platform set if it names no platform at all or
    /// one of its tags matches an active platform.
    pub fn is_active_platform(&self, active: &HashSet<String>) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|candidate| crate::core::platform::matches_any(active, candidate))
    }

    pub fn overrides_other_site(&self) -> bool {
        !self.overridden_sites.is_empty()
    }

    /// Record (or replace) the shadow entry for one site.
    pub fn add_overridden_site(&mut self, site: String, record: FileRecord) {
        self.overridden_sites.retain(|(name, _)| *name != site);
        self.overridden_sites.push((site, record));
    }

    /// A record never shadows its own update site.
    pub fn prune_self_shadow(&mut self) {
        if let Some(own) = self.update_site.clone() {
            self.overridden_sites.retain(|(name, _)| *name != own);
        }
    }

    pub fn overridden_site(&self, site_name: &str) -> Option<&FileRecord> {
        self.overridden_sites
            .iter()
            .find(|(name, _)| name == site_name)
            .map(|(_, record)| record)
    }

    /// Merge a fresh upstream record for the same logical file.
    ///
    /// Same-site (or siteless) records replace the catalog-derived fields
    /// wholesale, demoting the displaced current version; a record from a
    /// different site only contributes its versions to the history.
    pub fn merge(&mut self, upstream: FileRecord) {
        for version in &upstream.previous {
            self.add_previous_version(version.clone());
        }
        if self.update_site.is_none() || self.update_site == upstream.update_site {
            let displaced_current = self.current.take().filter(|current| {
                !upstream_has_version(&upstream, &current.checksum)
            });
            self.update_site = upstream.update_site;
            self.description = upstream.description;
            self.dependencies = upstream.dependencies;
            self.authors = upstream.authors;
            self.platforms = upstream.platforms;
            self.categories = upstream.categories;
            self.links = upstream.links;
            self.filesize = upstream.filesize;
            self.executable = upstream.executable;
            if let Some(current) = displaced_current {
                self.add_previous_version(current);
            }
            self.current = upstream.current;
            self.status = upstream.status;
            self.action = upstream.action;
        } else if let Some(other) = upstream.current {
            if !self.has_previous_version(&other.checksum) {
                self.add_previous_version(other);
            }
        }
    }

    /// Record a successful upload: the local copy becomes the current
    /// version.
    pub fn mark_uploaded(&mut self) {
        if self.is_local_only() {
            self.status = Status::Installed;
            if let Some(current) = &self.current {
                self.local_checksum = Some(current.checksum.clone());
                self.local_timestamp = current.timestamp;
            }
        } else if self.is_obsolete() || self.status == Status::Updateable {
            // force re-upload
            self.status = Status::Installed;
            if let (Some(checksum), timestamp) = (self.local_checksum.clone(), self.local_timestamp)
            {
                self.set_version(checksum, timestamp);
            }
        } else if let (Some(checksum), timestamp) =
            (self.local_checksum.clone(), self.local_timestamp)
        {
            self.set_version(checksum, timestamp);
        }
        self.set_no_action();
    }
}

fn upstream_has_version(upstream: &FileRecord, checksum: &str) -> bool {
    upstream.has_previous_version(checksum)
}

impl std::fmt::Display for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_file(checksum: &str) -> FileRecord {
        FileRecord::new(
            Some("Main".into()),
            "macros/hello.ijm",
            10,
            Some(checksum.into()),
            20240101000000,
            Status::NotInstalled,
        )
    }

    #[test]
    fn matching_local_digest_means_installed() {
        let mut file = catalog_file("aaaa");
        file.set_local_version("macros/hello.ijm", "aaaa", 20240202000000);
        assert_eq!(file.status(), Status::Installed);
        assert_eq!(file.action(), Action::Installed);
    }

    #[test]
    fn previous_digest_means_updateable() {
        let mut file = catalog_file("aaaa");
        file.add_previous_version(Version::new("bbbb", 20230101000000));
        file.set_local_version("macros/hello.ijm", "bbbb", 20230101000000);
        assert_eq!(file.status(), Status::Updateable);
    }

    #[test]
    fn unknown_digest_means_modified() {
        let mut file = catalog_file("aaaa");
        file.set_local_version("macros/hello.ijm", "cccc", 20240101000000);
        assert_eq!(file.status(), Status::Modified);
    }

    #[test]
    fn no_current_version_means_obsolete() {
        let mut file = catalog_file("aaaa");
        file.current = None;
        file.add_previous_version(Version::new("bbbb", 20230101000000));
        file.set_local_version("macros/hello.ijm", "bbbb", 20230101000000);
        assert_eq!(file.status(), Status::Obsolete);
        file.set_local_version("macros/hello.ijm", "dddd", 20230101000000);
        assert_eq!(file.status(), Status::ObsoleteModified);
    }

    #[test]
    fn shadowed_records_contribute_history() {
        let mut winner = catalog_file("aaaa");
        let mut loser = catalog_file("old");
        loser.update_site = Some("Legacy".into());
        loser.add_previous_version(Version::new("ancient", 20200101000000));
        winner.overridden_sites.push(("Legacy".into(), loser));
        assert!(winner.has_previous_version("ancient"));
        assert!(winner.has_previous_version("old"));
    }

    #[test]
    fn dependency_keys_are_version_stripped() {
        let mut file = catalog_file("aaaa");
        file.add_dependency(Dependency::new("jars/engine-1.0.2.jar", 20240101000000, false));
        assert!(file.has_dependency("jars/engine.jar"));
        assert!(file.has_dependency("jars/engine-2.0.0.jar"));
        assert_eq!(file.dependencies.len(), 1);
        assert_eq!(file.dependencies[0].filename, "jars/engine.jar");
    }

    #[test]
    fn merge_same_site_demotes_current() {
        let mut local = catalog_file("aaaa");
        let upstream = catalog_file("bbbb");
        local.merge(upstream);
        assert_eq!(
            local.current.as_ref().map(|version| version.checksum.as_str()),
            Some("bbbb")
        );
        assert!(local.has_previous_version("aaaa"));
    }

    #[test]
    fn merge_other_site_only_contributes_versions() {
        let mut local = catalog_file("aaaa");
        let mut upstream = catalog_file("bbbb");
        upstream.update_site = Some("Other".into());
        local.merge(upstream);
        assert_eq!(
            local.current.as_ref().map(|version| version.checksum.as_str()),
            Some("aaaa")
        );
        assert!(local.has_previous_version("bbbb"));
    }

    #[test]
    fn empty_platform_set_applies_everywhere() {
        let file = catalog_file("aaaa");
        let active: HashSet<String> = ["linux64".to_string()].into();
        assert!(file.is_active_platform(&active));
    }

    #[test]
    fn family_tag_applies_to_concrete_platform() {
        let mut file = catalog_file("aaaa");
        file.add_platform("winx");
        let active: HashSet<String> = ["win-arm64".to_string()].into();
        assert!(file.is_active_platform(&active));
        let linux: HashSet<String> = ["linux64".to_string()].into();
        assert!(!file.is_active_platform(&linux));
    }
}
