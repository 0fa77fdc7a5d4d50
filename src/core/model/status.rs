/// What the user (or the reconciler) decided to do with a file. The first
/// seven variants are inert: they describe the state without changing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    // no changes
    LocalOnly,
    NotInstalled,
    Installed,
    Updateable,
    Modified,
    New,
    Obsolete,
    // changes
    Uninstall,
    Install,
    Update,
    // developer-only changes
    Upload,
    Remove,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Action::LocalOnly => "Local-only",
            Action::NotInstalled => "Not installed",
            Action::Installed => "Up-to-date",
            Action::Updateable => "Update available",
            Action::Modified => "Locally modified",
            Action::New => "New file",
            Action::Obsolete => "Obsolete",
            Action::Uninstall => "Uninstall it",
            Action::Install => "Install it",
            Action::Update => "Update it",
            Action::Upload => "Upload it",
            Action::Remove => "Remove it",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Descriptive state of a file, derived from the local digest and the
/// catalog's current/previous versions. Each status owns the set of actions
/// that may legally be requested; the first entry is the no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NotInstalled,
    Installed,
    Updateable,
    Modified,
    LocalOnly,
    New,
    ObsoleteUninstalled,
    Obsolete,
    ObsoleteModified,
}

impl Status {
    pub fn valid_actions(self) -> &'static [Action] {
        match self {
            Status::NotInstalled => &[Action::NotInstalled, Action::Install, Action::Remove],
            Status::Installed => &[Action::Installed, Action::Uninstall],
            Status::Updateable => &[
                Action::Updateable,
                Action::Uninstall,
                Action::Update,
                Action::Upload,
            ],
            Status::Modified => &[
                Action::Modified,
                Action::Uninstall,
                Action::Update,
                Action::Upload,
            ],
            Status::LocalOnly => &[Action::LocalOnly, Action::Uninstall, Action::Upload],
            Status::New => &[Action::New, Action::Install, Action::Remove],
            Status::ObsoleteUninstalled => &[Action::NotInstalled],
            Status::Obsolete => &[Action::Obsolete, Action::Uninstall, Action::Upload],
            Status::ObsoleteModified => &[Action::Modified, Action::Uninstall, Action::Upload],
        }
    }

    pub fn is_valid(self, action: Action) -> bool {
        self.valid_actions().contains(&action)
    }

    pub fn no_action(self) -> Action {
        self.valid_actions()[0]
    }

    pub fn is_obsolete(self) -> bool {
        matches!(
            self,
            Status::Obsolete | Status::ObsoleteModified | Status::ObsoleteUninstalled
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::NotInstalled => "Not installed",
            Status::Installed => "Up-to-date",
            Status::Updateable => "Update available",
            Status::Modified => "Locally modified",
            Status::LocalOnly => "Local-only",
            Status::New => "New file",
            Status::ObsoleteUninstalled => "Obsolete (uninstalled)",
            Status::Obsolete => "Obsolete",
            Status::ObsoleteModified => "Obsolete (modified)",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [Status; 9] = [
        Status::NotInstalled,
        Status::Installed,
        Status::Updateable,
        Status::Modified,
        Status::LocalOnly,
        Status::New,
        Status::ObsoleteUninstalled,
        Status::Obsolete,
        Status::ObsoleteModified,
    ];

    #[test]
    fn no_action_is_always_valid() {
        for status in ALL_STATUSES {
            assert!(status.is_valid(status.no_action()), "{status:?}");
        }
    }

    #[test]
    fn obsolete_uninstalled_is_inert() {
        assert_eq!(
            Status::ObsoleteUninstalled.valid_actions(),
            &[Action::NotInstalled]
        );
    }

    #[test]
    fn upload_requires_a_known_version_state() {
        for status in [Status::NotInstalled, Status::Installed, Status::New] {
            assert!(!status.is_valid(Action::Upload), "{status:?}");
        }
        for status in [
            Status::Updateable,
            Status::Modified,
            Status::LocalOnly,
            Status::Obsolete,
            Status::ObsoleteModified,
        ] {
            assert!(status.is_valid(Action::Upload), "{status:?}");
        }
    }
}
