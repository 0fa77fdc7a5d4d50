mod transport;

pub use transport::{create_transport, FileTransport, Payload, PayloadSource, Transport};

use tracing::{info, warn};

use crate::core::catalog::{fetch, writer};
use crate::core::conflicts::{needs_feedback, Conflicts};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::{Action, FileRecord, FilesCollection, Status};
use crate::core::progress::Progress;
use crate::core::util;

/// Drives one site's catalog swap.
///
/// The ordering discipline: the re-serialized catalog travels as
/// `db.xml.gz.lock` and is the first payload written but the last name
/// renamed, so a concurrent uploader sees either the old catalog or the
/// complete new state, never a half-published site. The site's recorded
/// timestamp must match the remote catalog's mtime before anything is
/// written; a mismatch means somebody else published since our last read.
pub struct FilesUploader<'a> {
    files: &'a mut FilesCollection,
    site_name: String,
    transport: Box<dyn Transport>,
    logged_in: bool,
}

impl<'a> FilesUploader<'a> {
    pub fn new(files: &'a mut FilesCollection, site_name: &str) -> UpdaterResult<Self> {
        let site = files
            .get_site(site_name, false)
            .ok_or_else(|| UpdaterError::UnknownSite(site_name.to_string()))?;
        let transport = create_transport(site)?;
        Ok(Self {
            files,
            site_name: site_name.to_string(),
            transport,
            logged_in: false,
        })
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    pub async fn login(&mut self) -> UpdaterResult<()> {
        if self.logged_in {
            return Ok(());
        }
        let site = self
            .files
            .get_site(&self.site_name, false)
            .ok_or_else(|| UpdaterError::UnknownSite(self.site_name.clone()))?
            .clone();
        self.transport.login(&site).await?;
        self.logged_in = true;
        Ok(())
    }

    pub async fn logout(&mut self) {
        self.transport.logout().await;
        self.logged_in = false;
    }

    pub async fn upload(&mut self, progress: &mut dyn Progress) -> UpdaterResult<()> {
        if !self.logged_in {
            return Err(UpdaterError::Other("Not logged in!".to_string()));
        }
        let conflicts = Conflicts::new(self.files).list(true);
        if needs_feedback(&conflicts) {
            return Err(UpdaterError::Conflicts(util::join("\n", conflicts.iter())));
        }

        self.verify_site_timestamp().await?;

        // Unchanged files whose on-disk name changed still need their
        // metadata republished.
        let renamed = self.files.keys_where(|file| {
            file.update_site.as_deref() == Some(self.site_name.as_str())
                && file.action() == Action::Installed
                && file.metadata_changed
                && file
                    .local_filename
                    .as_deref()
                    .is_some_and(|local| local != file.filename)
        });
        for key in renamed {
            if let Some(file) = self.files.get_mut(&key) {
                if let Some(current) = file.current.clone() {
                    let mut demoted = current;
                    demoted.filename = Some(file.filename.clone());
                    file.add_previous_version(demoted);
                }
            }
            self.files.set_action(&key, Action::Upload)?;
        }

        // Remove dependencies that no longer resolve before serializing.
        let upload_keys = self.files.keys_where(|file| {
            file.to_upload() && file.update_site.as_deref() == Some(self.site_name.as_str())
        });
        for key in &upload_keys {
            let Some(file) = self.files.get(key) else {
                continue;
            };
            let stale: Vec<String> = file
                .dependencies
                .iter()
                .filter(|dep| {
                    self.files
                        .get(&dep.filename)
                        .map_or(true, |other| other.is_obsolete())
                })
                .map(|dep| dep.filename.clone())
                .collect();
            if !stale.is_empty() {
                if let Some(file) = self.files.get_mut(key) {
                    for dependency in stale {
                        warn!(
                            "Removed obsolete dependency {dependency} of {}",
                            file.filename
                        );
                        file.remove_dependency(&dependency);
                    }
                }
            }
        }

        // Snapshot sizes and timestamps; nothing may change under us.
        let mut payload_files: Vec<(String, std::path::PathBuf, u64)> = Vec::new();
        for key in &upload_keys {
            let Some(file) = self.files.get(key) else {
                continue;
            };
            let local_name = file.local_filename_or_default().to_string();
            let path = self.files.prefix(&local_name);
            let timestamp = util::file_timestamp(&path)?;
            self.verify_unchanged(file, &path, true)?;
            payload_files.push((key.clone(), path, timestamp));
        }

        // The server clock stamps every uploaded record.
        let timestamp = self.transport.timestamp().await?;
        let mut payloads = vec![Payload::from_bytes(
            format!("{}.lock", util::XML_COMPRESSED),
            Vec::new(),
        )];
        for (key, path, _) in &payload_files {
            let Some(file) = self.files.get_mut(key) else {
                continue;
            };
            file.filesize = std::fs::metadata(path)
                .map(|metadata| metadata.len())
                .map_err(UpdaterError::io(path))?;
            file.local_timestamp = timestamp;
            if file.status() == Status::LocalOnly {
                file.set_status(Status::Installed);
                file.force_action(Action::Upload);
                if let Some(current) = &mut file.current {
                    current.timestamp = timestamp;
                }
            }
            let filesize = file.filesize;
            let upload_name = format!("{}-{}", file.filename, timestamp);
            payloads.push(Payload {
                filename: upload_name,
                source: PayloadSource::File(path.clone()),
                filesize,
            });
        }

        // Serialize the remote variant of this site's records.
        let records: Vec<FileRecord> = self
            .files
            .for_update_site(&self.site_name, true)
            .into_iter()
            .cloned()
            .collect();
        let mut site_view = self.files.subset(records);
        payloads[0] = Payload::from_bytes(
            format!("{}.lock", util::XML_COMPRESSED),
            writer::to_compressed_bytes(&mut site_view, false)?,
        );

        let locks = vec![util::XML_COMPRESSED.to_string()];
        self.transport.upload(&payloads, &locks, progress).await?;

        // The payloads may not have changed while they streamed.
        for (key, path, before) in &payload_files {
            let after = util::file_timestamp(path)?;
            if after != *before {
                return Err(UpdaterError::TimestampSkew {
                    filename: key.clone(),
                    recorded: *before,
                    actual: after,
                });
            }
        }

        // Removals demote their history and may unshadow another site's
        // record; uploaded records stay action-marked until the local
        // catalog write demotes the displaced versions.
        let removal_keys = self.files.keys_where(|file| {
            file.to_remove() && file.update_site.as_deref() == Some(self.site_name.as_str())
        });
        for key in removal_keys {
            self.files.mark_removed(&key)?;
        }

        let site_url = self
            .files
            .get_site(&self.site_name, false)
            .map(|site| format!("{}{}", site.url(), util::XML_COMPRESSED));
        if let Some(url) = site_url {
            if let Ok(Some(millis)) = fetch::remote_last_modified(&url).await {
                if let Some(site) = self.files.get_site_mut(&self.site_name) {
                    site.set_last_modified(millis);
                }
            }
        }
        info!("Uploaded to site '{}'", self.site_name);
        Ok(())
    }

    /// Abort when the remote catalog moved since we last read it.
    async fn verify_site_timestamp(&self) -> UpdaterResult<()> {
        let site = self
            .files
            .get_site(&self.site_name, false)
            .ok_or_else(|| UpdaterError::UnknownSite(self.site_name.clone()))?;
        if site.timestamp == 0 {
            return Ok(()); // initial upload
        }
        let url = format!("{}{}", site.url(), util::XML_COMPRESSED);
        let remote = fetch::remote_last_modified(&url).await?.unwrap_or(0);
        if !site.is_last_modified(remote) {
            return Err(UpdaterError::SiteSkew {
                site: self.site_name.clone(),
                recorded: site.timestamp,
                actual: util::timestamp_from_millis(remote),
            });
        }
        Ok(())
    }

    fn verify_unchanged(
        &self,
        file: &FileRecord,
        path: &std::path::Path,
        check_timestamp: bool,
    ) -> UpdaterResult<()> {
        // The record's filesize tracks the local copy only for files the
        // scanner created; catalog-owned records advertise the remote size.
        if file.status() == Status::LocalOnly {
            let size = std::fs::metadata(path)
                .map(|metadata| metadata.len())
                .map_err(UpdaterError::io(path))?;
            if file.filesize != size {
                return Err(UpdaterError::SizeMismatch {
                    path: path.to_path_buf(),
                    expected: file.filesize,
                    actual: size,
                });
            }
        }
        if check_timestamp {
            let recorded = if file.status() == Status::LocalOnly {
                file.current
                    .as_ref()
                    .map(|version| version.timestamp)
                    .unwrap_or(file.local_timestamp)
            } else {
                file.local_timestamp
            };
            let actual = util::file_timestamp(path)?;
            if recorded != actual {
                return Err(UpdaterError::TimestampSkew {
                    filename: file.filename.clone(),
                    recorded,
                    actual,
                });
            }
        }
        Ok(())
    }
}
