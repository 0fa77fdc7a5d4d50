use std::path::PathBuf;
use thiserror::Error;

/// Central error type for the entire updater backend.
/// Every module returns `Result<T, UpdaterError>`.
#[derive(Debug, Error)]
pub enum UpdaterError {
    // ── IO ──────────────────────────────────────────────
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    // ── Network ─────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download failed for {url}: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error("Network unavailable while reaching {url}")]
    NetworkUnavailable { url: String },

    #[error("Proxy requires authentication")]
    ProxyAuthRequired,

    // ── Catalog ─────────────────────────────────────────
    #[error("Corrupt catalog: {0}")]
    CorruptCatalog(String),

    #[error("Remote catalog of site '{site}' changed (recorded {recorded}, found {actual})")]
    SiteSkew {
        site: String,
        recorded: u64,
        actual: u64,
    },

    #[error("Catalog of site '{site}' is locked by another upload")]
    LockContested { site: String },

    #[error("'{filename}' is claimed by sites '{first}' and '{second}' of equal rank")]
    ShadowConflict {
        filename: String,
        first: String,
        second: String,
    },

    // ── Integrity ───────────────────────────────────────
    #[error("Checksum mismatch for {path:?}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("File size mismatch for {path:?}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("'{filename}' changed since it was checksummed (was {recorded}, is {actual})")]
    TimestampSkew {
        filename: String,
        recorded: u64,
        actual: u64,
    },

    // ── Dependencies ────────────────────────────────────
    #[error("'{filename}' has unresolved dependency '{dependency}'")]
    DependencyUnresolved {
        filename: String,
        dependency: String,
    },

    #[error("Circular dependency detected: {0}")]
    DependencyCycle(String),

    #[error("Multiple local versions of '{0}' exist")]
    MultipleLocalVersions(String),

    // ── State machine ───────────────────────────────────
    #[error("Invalid action '{action}' requested for '{filename}' ({status})")]
    InvalidAction {
        filename: String,
        action: String,
        status: String,
    },

    #[error("'{filename}' does not apply to platform '{platform}'")]
    PlatformMismatch { filename: String, platform: String },

    #[error("File not found in the collection: {0}")]
    UnknownFile(String),

    #[error("Unknown update site: {0}")]
    UnknownSite(String),

    // ── Installation root ───────────────────────────────
    #[error("Installation root {0:?} is in an OS-protected location")]
    ProtectedLocation(PathBuf),

    #[error("Installation root {0:?} is not writable")]
    ReadOnlyRoot(PathBuf),

    // ── Upload ──────────────────────────────────────────
    #[error("No transport available for protocol '{0}'")]
    TransportUnavailable(String),

    // ── Conflicts ───────────────────────────────────────
    #[error("Unresolved conflicts:\n{0}")]
    Conflicts(String),

    // ── Parsing / archives ──────────────────────────────
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    // ── Generic ─────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type UpdaterResult<T> = Result<T, UpdaterError>;

impl From<std::io::Error> for UpdaterError {
    fn from(source: std::io::Error) -> Self {
        UpdaterError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

impl UpdaterError {
    /// Attach path context to an `std::io::Error`.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> UpdaterError {
        let path = path.into();
        move |source| UpdaterError::Io { path, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdaterError::Io { .. } => "io",
            UpdaterError::Http(_) | UpdaterError::DownloadFailed { .. } => "network",
            UpdaterError::NetworkUnavailable { .. } => "network-unavailable",
            UpdaterError::ProxyAuthRequired => "proxy-auth-required",
            UpdaterError::CorruptCatalog(_) => "corrupt-catalog",
            UpdaterError::SiteSkew { .. } => "site-skew",
            UpdaterError::LockContested { .. } => "lock-contested",
            UpdaterError::ShadowConflict { .. } => "shadow-conflict",
            UpdaterError::DigestMismatch { .. } => "digest-mismatch",
            UpdaterError::SizeMismatch { .. } => "size-mismatch",
            UpdaterError::TimestampSkew { .. } => "timestamp-skew",
            UpdaterError::DependencyUnresolved { .. } => "dependency-unresolved",
            UpdaterError::DependencyCycle(_) => "dependency-cycle",
            UpdaterError::MultipleLocalVersions(_) => "multiple-local-versions",
            UpdaterError::InvalidAction { .. } => "invalid-action",
            UpdaterError::PlatformMismatch { .. } => "platform-mismatch",
            UpdaterError::UnknownFile(_) => "unknown-file",
            UpdaterError::UnknownSite(_) => "unknown-site",
            UpdaterError::ProtectedLocation(_) => "protected-location",
            UpdaterError::ReadOnlyRoot(_) => "read-only-root",
            UpdaterError::TransportUnavailable(_) => "transport-unavailable",
            UpdaterError::Conflicts(_) => "conflicts",
            UpdaterError::Xml(_) => "parsing",
            UpdaterError::Zip(_) => "archive",
            UpdaterError::Other(_) => "generic",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UpdaterError::Http(_)
                | UpdaterError::DownloadFailed { .. }
                | UpdaterError::NetworkUnavailable { .. }
                | UpdaterError::SiteSkew { .. }
                | UpdaterError::LockContested { .. }
                | UpdaterError::TimestampSkew { .. }
                | UpdaterError::Conflicts(_)
        )
    }
}
