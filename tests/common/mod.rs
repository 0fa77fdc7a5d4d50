#![allow(dead_code)] // each test binary uses a different slice of this

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use spectra_updater::core::catalog;
use spectra_updater::core::hasher;
use spectra_updater::core::model::FilesCollection;

/// Builds an update site in a directory: payload files under their
/// versioned names plus the compressed remote-variant catalog.
pub struct SiteBuilder {
    pub dir: PathBuf,
    plugins: String,
}

impl SiteBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            plugins: String::new(),
        }
    }

    pub fn url(&self) -> String {
        format!("file:{}/", self.dir.display())
    }

    /// Write a payload under its versioned name and return its digest.
    pub fn payload(&self, filename: &str, timestamp: u64, contents: &[u8]) -> String {
        let path = self.dir.join(format!("{filename}-{timestamp}"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        hasher::digest(filename, &path).unwrap()
    }

    pub fn plugin(&mut self, filename: &str, checksum: &str, timestamp: u64, filesize: u64) {
        let _ = writeln!(
            self.plugins,
            r#"    <plugin filename="{filename}">
        <version checksum="{checksum}" timestamp="{timestamp}" filesize="{filesize}"/>
    </plugin>"#
        );
    }

    pub fn plugin_xml(&mut self, xml: &str) {
        self.plugins.push_str(xml);
        self.plugins.push('\n');
    }

    pub fn write_catalog(&self) {
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<pluginRecords>\n{}</pluginRecords>\n",
            self.plugins
        );
        let compressed = catalog::gzip(xml.as_bytes()).unwrap();
        std::fs::write(self.dir.join("db.xml.gz"), compressed).unwrap();
    }
}

/// A collection rooted in `root` whose default site points at `site`.
pub fn collection_for(root: &Path, site: &SiteBuilder) -> FilesCollection {
    let mut files = FilesCollection::new(root);
    let url = site.url();
    files
        .get_site_mut("Spectra")
        .expect("default site")
        .set_url(url);
    files
}

pub fn write_local(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}
