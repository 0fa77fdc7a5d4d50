use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::{Dependency, FileRecord, FilesCollection, Status, UpdateSite, Version};
use crate::core::util;

/// Parse a catalog document into the collection.
///
/// `site` is the owning update site when reading the remote variant; `None`
/// reads the local variant, where each plugin element names its own site and
/// site declarations precede the records. Missing required attributes raise
/// `CorruptCatalog`; unknown attributes and elements are ignored.
pub fn read(files: &mut FilesCollection, site: Option<&str>, xml: &[u8]) -> UpdaterResult<()> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    // Records newer than the site's last-read timestamp are NEW (offered);
    // older unknown records were declined before and stay NOT_INSTALLED.
    let new_since = site
        .and_then(|name| files.get_site(name, true))
        .map(|site| site.timestamp)
        .unwrap_or(0);

    let mut parser = Parser {
        files,
        site: site.map(String::from),
        new_since,
        plugin: None,
        version_open: false,
        text_target: None,
        text: String::new(),
    };

    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(element)) => parser.open(&element)?,
            Ok(Event::Empty(element)) => {
                parser.open(&element)?;
                parser.close(element.name().as_ref())?;
            }
            Ok(Event::Text(text)) => {
                parser.text.push_str(&text.unescape()?);
            }
            Ok(Event::End(element)) => parser.close(element.name().as_ref())?,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(error) => {
                return Err(UpdaterError::CorruptCatalog(format!(
                    "XML parse error at byte {}: {error}",
                    reader.buffer_position()
                )))
            }
        }
        buffer.clear();
    }
    Ok(())
}

struct Parser<'a> {
    files: &'a mut FilesCollection,
    site: Option<String>,
    new_since: u64,
    plugin: Option<FileRecord>,
    version_open: bool,
    text_target: Option<&'static str>,
    text: String,
}

impl Parser<'_> {
    fn open(&mut self, element: &BytesStart<'_>) -> UpdaterResult<()> {
        let attrs = attributes(element)?;
        match element.name().as_ref() {
            b"update-site" | b"disabled-update-site" => {
                // Site declarations only exist in the local variant.
                if self.site.is_none() {
                    self.read_site(
                        &attrs,
                        element.name().as_ref() == b"update-site",
                    )?;
                }
            }
            b"plugin" => self.read_plugin(&attrs)?,
            b"version" => self.read_version(&attrs)?,
            b"previous-version" => self.read_previous_version(&attrs)?,
            b"dependency" => self.read_dependency(&attrs)?,
            b"description" => self.start_text("description"),
            b"link" => self.start_text("link"),
            b"author" => self.start_text("author"),
            b"platform" => self.start_text("platform"),
            b"category" => self.start_text("category"),
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) -> UpdaterResult<()> {
        match name {
            b"plugin" => {
                if let Some(record) = self.plugin.take() {
                    add_with_merge(self.files, record, self.site.is_some(), self.new_since)?;
                }
            }
            b"version" => self.version_open = false,
            b"description" | b"link" | b"author" | b"platform" | b"category" => {
                let value = std::mem::take(&mut self.text);
                if let (Some(target), Some(record)) = (self.text_target.take(), &mut self.plugin)
                {
                    match target {
                        "description" if self.version_open => {
                            record.description = Some(value)
                        }
                        "link" => record.add_link(&value),
                        "author" => record.add_author(&value),
                        "platform" => record.add_platform(&value),
                        "category" => record.add_category(&value),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn start_text(&mut self, target: &'static str) {
        self.text_target = Some(target);
        self.text.clear();
    }

    fn read_site(&mut self, attrs: &HashMap<String, String>, active: bool) -> UpdaterResult<()> {
        let name = required(attrs, "update-site", "name")?;
        let url = required(attrs, "update-site", "url")?;
        let timestamp = required(attrs, "update-site", "timestamp")?
            .parse()
            .map_err(|_| UpdaterError::CorruptCatalog("non-numeric site timestamp".into()))?;
        let mut site = UpdateSite::new(
            name,
            url.clone(),
            attrs.get("ssh-host").cloned(),
            attrs.get("upload-directory").cloned(),
            timestamp,
        );
        site.active = active;
        site.official = attrs.get("official").map(String::as_str) == Some("true");
        site.keep_url = attrs.get("keep-url").map(String::as_str) == Some("true");
        if site.keep_url {
            // Pinned URLs must escape the obsolete-URL rewriting.
            site.set_url(url);
        }
        site.description = attrs.get("description").cloned();
        site.maintainer = attrs.get("maintainer").cloned();
        let official = site.official;
        let added = self.files.add_site(site);
        added.official = official;
        Ok(())
    }

    fn read_plugin(&mut self, attrs: &HashMap<String, String>) -> UpdaterResult<()> {
        let filename = required(attrs, "plugin", "filename")?;
        let site = match &self.site {
            Some(site) => Some(site.clone()),
            None => attrs.get("update-site").cloned(),
        };
        if self.site.is_none() && site.is_none() {
            return Err(UpdaterError::CorruptCatalog(format!(
                "plugin '{filename}' lacks an update-site"
            )));
        }
        let mut record = FileRecord::new(site, filename, 0, None, 0, Status::NotInstalled);
        record.executable = attrs.get("executable").map(String::as_str) == Some("true");
        self.plugin = Some(record);
        Ok(())
    }

    fn read_version(&mut self, attrs: &HashMap<String, String>) -> UpdaterResult<()> {
        let record = self.plugin.as_mut().ok_or_else(|| {
            UpdaterError::CorruptCatalog("version element outside a plugin".into())
        })?;
        let checksum = required(attrs, "version", "checksum")?;
        let timestamp: u64 = required(attrs, "version", "timestamp")?
            .parse()
            .map_err(|_| UpdaterError::CorruptCatalog("non-numeric version timestamp".into()))?;
        let filesize: u64 = required(attrs, "version", "filesize")?
            .parse()
            .map_err(|_| UpdaterError::CorruptCatalog("non-numeric filesize".into()))?;
        record.current = Some(Version::new(checksum, timestamp));
        record.filesize = filesize;
        self.version_open = true;
        Ok(())
    }

    fn read_previous_version(&mut self, attrs: &HashMap<String, String>) -> UpdaterResult<()> {
        let record = self.plugin.as_mut().ok_or_else(|| {
            UpdaterError::CorruptCatalog("previous-version element outside a plugin".into())
        })?;
        let checksum = required(attrs, "previous-version", "checksum")?;
        let timestamp: u64 = required(attrs, "previous-version", "timestamp")?
            .parse()
            .map_err(|_| UpdaterError::CorruptCatalog("non-numeric version timestamp".into()))?;
        let mut version = Version::new(checksum, timestamp);
        version.timestamp_obsolete = attrs
            .get("timestamp-obsolete")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        version.filename = attrs.get("filename").cloned().filter(|name| !name.is_empty());
        record.add_previous_version(version);
        Ok(())
    }

    fn read_dependency(&mut self, attrs: &HashMap<String, String>) -> UpdaterResult<()> {
        let record = self.plugin.as_mut().ok_or_else(|| {
            UpdaterError::CorruptCatalog("dependency element outside a plugin".into())
        })?;
        let filename = required(attrs, "dependency", "filename")?;
        let timestamp = attrs
            .get("timestamp")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let overrides = attrs.get("overrides").map(String::as_str) == Some("true");
        record.add_dependency(Dependency::new(filename, timestamp, overrides));
        Ok(())
    }
}

fn attributes(element: &BytesStart<'_>) -> UpdaterResult<HashMap<String, String>> {
    let mut result = HashMap::new();
    for attr in element.attributes() {
        let attr = attr
            .map_err(|error| UpdaterError::CorruptCatalog(format!("bad attribute: {error}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|error| UpdaterError::CorruptCatalog(format!("bad attribute: {error}")))?
            .to_string();
        result.insert(key, value);
    }
    Ok(result)
}

fn required(attrs: &HashMap<String, String>, element: &str, key: &str) -> UpdaterResult<String> {
    attrs.get(key).cloned().ok_or_else(|| {
        UpdaterError::CorruptCatalog(format!("{element} element lacks required '{key}'"))
    })
}

/// Insert a parsed record, resolving collisions by site rank.
///
/// Same-site records replace the existing entry (the scanner re-derives the
/// local state afterwards). A higher-ranked site shadows the incumbent,
/// keeping it recoverable in `overridden_sites`; a lower-ranked record is
/// tucked under the incumbent instead. Equal ranks from different sites are
/// a `ShadowConflict`.
fn add_with_merge(
    files: &mut FilesCollection,
    mut record: FileRecord,
    from_remote: bool,
    new_since: u64,
) -> UpdaterResult<()> {
    if from_remote && record.current.is_some() && record.is_newer_than(new_since) {
        // Appeared since our last sync: offer, don't nag.
        record.set_status(Status::New);
    }
    let key = record.filename_stripped();
    let Some(existing) = files.get(&key) else {
        files.add(record);
        return Ok(());
    };

    if existing.update_site.is_none() || existing.update_site == record.update_site {
        let existing_local = existing.is_local_only();
        if let Some(existing) = files.get_mut(&key) {
            if from_remote && existing_local {
                // A local-only file just appeared in a site's catalog; the
                // scanner will reconcile the digest on its next pass.
                let mut merged = record;
                merged.complete_metadata_from(existing);
                merged.local_filename = existing.local_filename.clone();
                merged.local_checksum = existing.local_checksum.clone();
                merged.local_timestamp = existing.local_timestamp;
                *existing = merged;
            } else {
                existing.merge(record);
            }
        }
        return Ok(());
    }

    let existing_site = existing.update_site.clone().unwrap_or_default();
    let existing_rank = files.site_rank(&existing_site).unwrap_or(0);
    let record_site = record.update_site.clone().unwrap_or_default();
    let record_rank = files.site_rank(&record_site).unwrap_or(0);

    if existing_rank == record_rank {
        return Err(UpdaterError::ShadowConflict {
            filename: record.filename,
            first: existing_site,
            second: record_site,
        });
    }

    if existing_rank < record_rank {
        // The new record wins; the incumbent becomes its shadow.
        let Some(displaced) = files.remove(&key) else {
            files.add(record);
            return Ok(());
        };
        if let Some(current) = displaced.current.clone() {
            if !record.has_previous_version(&current.checksum) {
                record.add_previous_version(current);
            }
        }
        for version in &displaced.previous {
            record.add_previous_version(version.clone());
        }
        record.local_filename = displaced.local_filename.clone();
        record.local_checksum = displaced.local_checksum.clone();
        record.local_timestamp = displaced.local_timestamp;
        let mut displaced = displaced;
        let shadows: Vec<(String, FileRecord)> = displaced.overridden_sites.drain(..).collect();
        for (shadow_site, shadow) in shadows {
            record.add_overridden_site(shadow_site, shadow);
        }
        record.add_overridden_site(existing_site, displaced);
        record.prune_self_shadow();
        files.add(record);
    } else {
        // The incumbent wins; remember the contender for unshadowing.
        let contender_current = record.current.clone();
        if let Some(existing) = files.get_mut(&key) {
            if let Some(version) = contender_current {
                if !existing.has_previous_version(&version.checksum) {
                    existing.add_previous_version(version);
                }
            }
            existing.add_overridden_site(record_site, record);
        }
    }
    Ok(())
}

/// Read the local `db.xml.gz` if present.
pub fn read_local_catalog(files: &mut FilesCollection) -> UpdaterResult<bool> {
    let path = files.prefix(util::XML_COMPRESSED);
    if !path.exists() {
        return Ok(false);
    }
    let compressed = std::fs::read(&path).map_err(UpdaterError::io(&path))?;
    let xml = super::gunzip(&compressed)?;
    read(files, None, &xml)?;
    Ok(true)
}
