use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::{FileRecord, FilesCollection, Status};
use crate::core::util;

/// The catalog schema, embedded into every written document.
const DTD: &str = "pluginRecords [\n\
<!ELEMENT pluginRecords ((update-site | disabled-update-site)*, plugin*)>\n\
<!ELEMENT update-site EMPTY>\n\
<!ELEMENT disabled-update-site EMPTY>\n\
<!ELEMENT plugin (platform*, category*, version?, previous-version*)>\n\
<!ELEMENT version (description?, dependency*, link*, author*)>\n\
<!ELEMENT previous-version EMPTY>\n\
<!ELEMENT description (#PCDATA)>\n\
<!ELEMENT dependency EMPTY>\n\
<!ELEMENT link (#PCDATA)>\n\
<!ELEMENT author (#PCDATA)>\n\
<!ELEMENT platform (#PCDATA)>\n\
<!ELEMENT category (#PCDATA)>\n\
<!ATTLIST update-site name CDATA #REQUIRED>\n\
<!ATTLIST update-site url CDATA #REQUIRED>\n\
<!ATTLIST update-site keep-url CDATA #IMPLIED>\n\
<!ATTLIST update-site official CDATA #IMPLIED>\n\
<!ATTLIST update-site ssh-host CDATA #IMPLIED>\n\
<!ATTLIST update-site upload-directory CDATA #IMPLIED>\n\
<!ATTLIST update-site description CDATA #IMPLIED>\n\
<!ATTLIST update-site maintainer CDATA #IMPLIED>\n\
<!ATTLIST update-site timestamp CDATA #REQUIRED>\n\
<!ATTLIST disabled-update-site name CDATA #REQUIRED>\n\
<!ATTLIST disabled-update-site url CDATA #REQUIRED>\n\
<!ATTLIST disabled-update-site keep-url CDATA #IMPLIED>\n\
<!ATTLIST disabled-update-site official CDATA #IMPLIED>\n\
<!ATTLIST disabled-update-site ssh-host CDATA #IMPLIED>\n\
<!ATTLIST disabled-update-site upload-directory CDATA #IMPLIED>\n\
<!ATTLIST disabled-update-site description CDATA #IMPLIED>\n\
<!ATTLIST disabled-update-site maintainer CDATA #IMPLIED>\n\
<!ATTLIST disabled-update-site timestamp CDATA #REQUIRED>\n\
<!ATTLIST plugin update-site CDATA #IMPLIED>\n\
<!ATTLIST plugin filename CDATA #REQUIRED>\n\
<!ATTLIST plugin executable CDATA #IMPLIED>\n\
<!ATTLIST dependency filename CDATA #REQUIRED>\n\
<!ATTLIST dependency timestamp CDATA #IMPLIED>\n\
<!ATTLIST dependency overrides CDATA #IMPLIED>\n\
<!ATTLIST version timestamp CDATA #REQUIRED>\n\
<!ATTLIST version checksum CDATA #REQUIRED>\n\
<!ATTLIST version filesize CDATA #REQUIRED>\n\
<!ATTLIST previous-version filename CDATA #IMPLIED>\n\
<!ATTLIST previous-version timestamp CDATA #REQUIRED>\n\
<!ATTLIST previous-version timestamp-obsolete CDATA #IMPLIED>\n\
<!ATTLIST previous-version checksum CDATA #REQUIRED>]";

/// Serialize the collection to uncompressed catalog XML.
///
/// The local variant leads with the site declarations; the remote variant
/// published to an update site omits them. Records whose current version is
/// displaced by this write all share one `timestamp-obsolete` so a single
/// update cannot produce skewed obsoletion times.
pub fn to_xml_bytes(files: &mut FilesCollection, local: bool) -> UpdaterResult<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::DocType(BytesText::from_escaped(DTD)))?;

    writer.write_event(Event::Start(BytesStart::new("pluginRecords")))?;

    if local {
        for name in files.site_names(true) {
            let site = match files.get_site(&name, true) {
                Some(site) => site,
                None => continue,
            };
            let tag = if site.active {
                "update-site"
            } else {
                "disabled-update-site"
            };
            let mut element = BytesStart::new(tag);
            element.push_attribute(("name", site.name.as_str()));
            element.push_attribute(("url", site.url()));
            if site.keep_url {
                element.push_attribute(("keep-url", "true"));
            }
            element.push_attribute(("official", if site.official { "true" } else { "false" }));
            if let Some(host) = &site.host {
                element.push_attribute(("ssh-host", host.as_str()));
            }
            if let Some(dir) = site.upload_directory() {
                element.push_attribute(("upload-directory", dir));
            }
            if let Some(description) = &site.description {
                element.push_attribute(("description", description.as_str()));
            }
            if let Some(maintainer) = &site.maintainer {
                element.push_attribute(("maintainer", maintainer.as_str()));
            }
            element.push_attribute(("timestamp", site.timestamp.to_string().as_str()));
            writer.write_event(Event::Empty(element))?;
        }
    }

    let timestamp_obsolete = util::current_timestamp();
    let keys = files.keys_where(|file| file.status() != Status::LocalOnly);
    for key in keys {
        // A current version displaced by this write (e.g. by a staged
        // upload) is demoted into the history before serialization, carrying
        // the shared obsoletion timestamp.
        if let Some(file) = files.get_mut(&key) {
            let written_checksum = file.checksum().map(String::from);
            if let Some(current) = &mut file.current {
                if written_checksum.as_deref() != Some(current.checksum.as_str()) {
                    current.timestamp_obsolete = timestamp_obsolete;
                }
            }
            if let Some(current) = file.current.clone() {
                if written_checksum.as_deref() != Some(current.checksum.as_str()) {
                    file.add_previous_version(current);
                }
            }
        }
        let file = files
            .get(&key)
            .ok_or_else(|| UpdaterError::UnknownFile(key.clone()))?
            .clone();
        write_record(&mut writer, &file, local)?;
    }

    writer.write_event(Event::End(BytesEnd::new("pluginRecords")))?;
    Ok(writer.into_inner().into_inner())
}

fn write_record(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    file: &FileRecord,
    local: bool,
) -> UpdaterResult<()> {
    let mut plugin = BytesStart::new("plugin");
    if local {
        let site = file.update_site.as_deref().ok_or_else(|| {
            UpdaterError::Other(format!("File {} has no update site", file.filename))
        })?;
        plugin.push_attribute(("update-site", site));
    }
    plugin.push_attribute(("filename", file.filename.as_str()));
    if file.executable {
        plugin.push_attribute(("executable", "true"));
    }
    writer.write_event(Event::Start(plugin))?;

    for platform in &file.platforms {
        write_text_tag(writer, "platform", platform)?;
    }
    for category in &file.categories {
        write_text_tag(writer, "category", category)?;
    }

    if let Some(checksum) = file.checksum() {
        let mut version = BytesStart::new("version");
        version.push_attribute(("checksum", checksum));
        version.push_attribute(("timestamp", file.timestamp().to_string().as_str()));
        version.push_attribute(("filesize", file.filesize.to_string().as_str()));
        writer.write_event(Event::Start(version))?;
        if let Some(description) = &file.description {
            write_text_tag(writer, "description", description)?;
        }
        for dependency in &file.dependencies {
            let mut element = BytesStart::new("dependency");
            element.push_attribute(("filename", dependency.filename.as_str()));
            element.push_attribute(("timestamp", dependency.timestamp.to_string().as_str()));
            if dependency.overrides {
                element.push_attribute(("overrides", "true"));
            }
            writer.write_event(Event::Empty(element))?;
        }
        for link in &file.links {
            write_text_tag(writer, "link", link)?;
        }
        for author in &file.authors {
            write_text_tag(writer, "author", author)?;
        }
        writer.write_event(Event::End(BytesEnd::new("version")))?;
    }

    for version in file.previous.iter() {
        let mut element = BytesStart::new("previous-version");
        element.push_attribute(("timestamp", version.timestamp.to_string().as_str()));
        if version.timestamp_obsolete > 0 {
            element.push_attribute((
                "timestamp-obsolete",
                version.timestamp_obsolete.to_string().as_str(),
            ));
        }
        element.push_attribute(("checksum", version.checksum.as_str()));
        if let Some(filename) = &version.filename {
            element.push_attribute(("filename", filename.as_str()));
        }
        writer.write_event(Event::Empty(element))?;
    }

    writer.write_event(Event::End(BytesEnd::new("plugin")))?;
    Ok(())
}

fn write_text_tag(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    value: &str,
) -> UpdaterResult<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// Round-trip check: the strict reader must accept our own output.
pub fn validate(files: &FilesCollection, xml: &[u8], local: bool) -> UpdaterResult<()> {
    let mut scratch = FilesCollection::new(files.root());
    for name in files.site_names(true) {
        if let Some(site) = files.get_site(&name, true) {
            scratch.add_site(site.clone());
        }
    }
    let site_name = files.site_names(true).into_iter().next();
    let site = if local { None } else { site_name };
    super::reader::read(&mut scratch, site.as_deref(), xml)?;
    Ok(())
}

pub fn to_compressed_bytes(files: &mut FilesCollection, local: bool) -> UpdaterResult<Vec<u8>> {
    let xml = to_xml_bytes(files, local)?;
    validate(files, &xml, local)?;
    super::gzip(&xml)
}

/// Persist the local catalog atomically: write to `.tmp`, keep one
/// `.backup`, rename into place.
pub fn write_local(files: &mut FilesCollection) -> UpdaterResult<()> {
    let compressed = to_compressed_bytes(files, true)?;
    let target = files.prefix(util::XML_COMPRESSED);
    let tmp = files.prefix(&format!("{}.tmp", util::XML_COMPRESSED));
    std::fs::write(&tmp, compressed).map_err(UpdaterError::io(&tmp))?;
    if target.exists() {
        let backup = files.prefix(&format!("{}.backup", util::XML_COMPRESSED));
        let _ = std::fs::remove_file(&backup);
        std::fs::rename(&target, &backup).map_err(UpdaterError::io(&target))?;
    }
    std::fs::rename(&tmp, &target).map_err(UpdaterError::io(&target))?;
    files.set_sites_changed(false);
    Ok(())
}
