use crate::core::util;

/// One addressable catalog source.
///
/// A site serves `db.xml.gz` plus the artifact payloads under a base URL.
/// `rank` is the merge precedence: the higher-ranked site's entry shadows a
/// lower-ranked one for the same logical filename. Two sites compare equal
/// iff their ranks are equal.
#[derive(Debug, Clone)]
pub struct UpdateSite {
    pub name: String,
    url: String,
    pub host: Option<String>,
    upload_directory: Option<String>,
    pub description: Option<String>,
    pub maintainer: Option<String>,
    /// Timestamp of the remote catalog when it was last read.
    pub timestamp: u64,
    pub active: bool,
    pub official: bool,
    /// User pinned the URL; never rewrite it automatically.
    pub keep_url: bool,
    pub rank: usize,
}

impl UpdateSite {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        host: Option<String>,
        upload_directory: Option<String>,
        timestamp: u64,
    ) -> Self {
        let mut site = Self {
            name: name.into(),
            url: String::new(),
            host,
            upload_directory: None,
            description: None,
            maintainer: None,
            timestamp,
            active: false,
            official: false,
            keep_url: false,
            rank: 0,
        };
        site.set_url(url.into());
        site.set_upload_directory(upload_directory);
        site
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: String) {
        let formatted = format_url(&url);
        self.url = if self.keep_url {
            ensure_trailing_slash(&url)
        } else {
            formatted
        };
    }

    pub fn upload_directory(&self) -> Option<&str> {
        self.upload_directory.as_deref()
    }

    pub fn set_upload_directory(&mut self, dir: Option<String>) {
        self.upload_directory = dir.map(|d| {
            if d.is_empty() || d.ends_with('/') {
                d
            } else {
                format!("{d}/")
            }
        });
    }

    pub fn is_uploadable(&self) -> bool {
        self.upload_directory.as_deref().is_some_and(|d| !d.is_empty())
            || self
                .host
                .as_deref()
                .is_some_and(|h| h.find(':').is_some_and(|colon| colon > 0))
    }

    /// The transport protocol encoded in the host string (`file:...`,
    /// `sftp:user@host`, ...); a bare `user@host` means ssh.
    pub fn upload_protocol(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let at = host.find('@');
        let colon = host.find(':');
        match (colon, at) {
            (Some(colon), Some(at)) if colon < at => Some(host[..colon].to_string()),
            (Some(colon), None) if colon > 0 => Some(host[..colon].to_string()),
            _ => Some("ssh".to_string()),
        }
    }

    /// Host with any protocol prefix and user part removed.
    pub fn upload_host(&self) -> Option<&str> {
        let mut host = self.host.as_deref()?;
        if let Some(protocol) = self.upload_protocol() {
            host = host.strip_prefix(&format!("{protocol}:")).unwrap_or(host);
        }
        Some(match host.find('@') {
            Some(at) => &host[at + 1..],
            None => host,
        })
    }

    pub fn is_last_modified(&self, millis: i64) -> bool {
        self.timestamp == util::timestamp_from_millis(millis)
    }

    pub fn set_last_modified(&mut self, millis: i64) {
        self.timestamp = util::timestamp_from_millis(millis);
    }
}

impl PartialEq for UpdateSite {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}

impl Eq for UpdateSite {}

impl std::fmt::Display for UpdateSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)?;
        if let Some(host) = &self.host {
            write!(f, ", {host}")?;
        }
        if let Some(dir) = &self.upload_directory {
            write!(f, ", {dir}")?;
        }
        Ok(())
    }
}

fn ensure_trailing_slash(url: &str) -> String {
    if url.is_empty() || url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// Known-obsolete site URLs and their replacements.
const URL_REWRITES: &[(&str, &str)] = &[
    (
        "http://update.spectra-imaging.org/",
        "https://update.spectra-imaging.org/",
    ),
    (
        "http://plugins.spectra-imaging.org/",
        "https://update.spectra-imaging.org/plugins/",
    ),
];

pub fn format_url(url: &str) -> String {
    let url = ensure_trailing_slash(url);
    for (obsolete, replacement) in URL_REWRITES {
        if url == *obsolete {
            return (*replacement).to_string();
        }
    }
    url
}
