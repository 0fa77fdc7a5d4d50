use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::model::UpdateSite;
use crate::core::progress::Progress;
use crate::core::util;

/// One file to push to a site, either staged bytes (the catalog) or a local
/// payload.
pub struct Payload {
    pub filename: String,
    pub source: PayloadSource,
    pub filesize: u64,
}

pub enum PayloadSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Payload {
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filesize = bytes.len() as u64;
        Self {
            filename: filename.into(),
            source: PayloadSource::Bytes(bytes),
            filesize,
        }
    }
}

/// A protocol implementation able to move payloads onto an update site.
///
/// The write protocol every transport must honor: all payloads land under
/// temporary names first (the catalog as `<lock>.lock`), and only after the
/// last byte of the last payload arrived are the lock names renamed over
/// their targets, lock first, with the previous catalog kept as `.old`.
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    fn protocol(&self) -> &'static str;

    async fn login(&mut self, site: &UpdateSite) -> UpdaterResult<()>;

    /// The server-side clock as a 14-digit timestamp; authoritative for
    /// every uploaded record, so client clock skew never enters catalogs.
    async fn timestamp(&mut self) -> UpdaterResult<u64>;

    async fn upload(
        &mut self,
        payloads: &[Payload],
        locks: &[String],
        progress: &mut dyn Progress,
    ) -> UpdaterResult<()>;

    async fn logout(&mut self);
}

/// All transports are statically linked; the registry maps their protocol
/// strings to constructors.
pub fn create_transport(site: &UpdateSite) -> UpdaterResult<Box<dyn Transport>> {
    let protocol = site
        .upload_protocol()
        .ok_or_else(|| UpdaterError::TransportUnavailable("<none>".to_string()))?;
    match protocol.as_str() {
        "file" => Ok(Box::new(FileTransport::new(site)?)),
        other => Err(UpdaterError::TransportUnavailable(other.to_string())),
    }
}

/// Transport for locally mounted site roots (`ssh-host="file:localhost"`).
#[derive(Debug)]
pub struct FileTransport {
    upload_dir: PathBuf,
}

impl FileTransport {
    fn new(site: &UpdateSite) -> UpdaterResult<Self> {
        let dir = site.upload_directory().ok_or_else(|| {
            UpdaterError::TransportUnavailable("file transport needs an upload directory".into())
        })?;
        Ok(Self {
            upload_dir: PathBuf::from(dir),
        })
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn protocol(&self) -> &'static str {
        "file"
    }

    async fn login(&mut self, _site: &UpdateSite) -> UpdaterResult<()> {
        if !self.upload_dir.is_dir() {
            return Err(UpdaterError::TransportUnavailable(format!(
                "upload directory {} does not exist",
                self.upload_dir.display()
            )));
        }
        Ok(())
    }

    async fn timestamp(&mut self) -> UpdaterResult<u64> {
        Ok(util::current_timestamp())
    }

    async fn upload(
        &mut self,
        payloads: &[Payload],
        locks: &[String],
        progress: &mut dyn Progress,
    ) -> UpdaterResult<()> {
        progress.set_title("Uploading");
        let total: u64 = payloads.iter().map(|payload| payload.filesize).sum();
        let mut count = 0u64;

        for payload in payloads {
            let target = self.upload_dir.join(&payload.filename);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(UpdaterError::io(parent))?;
            }
            progress.add_item(&payload.filename);
            match &payload.source {
                PayloadSource::Bytes(bytes) => {
                    let mut file = tokio::fs::File::create(&target)
                        .await
                        .map_err(UpdaterError::io(&target))?;
                    file.write_all(bytes)
                        .await
                        .map_err(UpdaterError::io(&target))?;
                    file.flush().await.map_err(UpdaterError::io(&target))?;
                }
                PayloadSource::File(source) => {
                    tokio::fs::copy(source, &target)
                        .await
                        .map_err(UpdaterError::io(source))?;
                }
            }
            count += payload.filesize;
            progress.set_item_count(payload.filesize as usize, payload.filesize as usize);
            progress.set_count(count as usize, total as usize);
            progress.item_done(&payload.filename);
        }

        // Every payload arrived: swap the locks into place.
        for lock in locks {
            let target = self.upload_dir.join(lock);
            let lock_file = self.upload_dir.join(format!("{lock}.lock"));
            let backup = self.upload_dir.join(format!("{lock}.old"));
            if backup.exists() {
                let _ = std::fs::remove_file(&backup);
            }
            if target.exists() {
                std::fs::rename(&target, &backup).map_err(UpdaterError::io(&target))?;
            }
            std::fs::rename(&lock_file, &target).map_err(UpdaterError::io(&lock_file))?;
            info!("Renamed {} to {}", lock_file.display(), target.display());
        }
        progress.done();
        Ok(())
    }

    async fn logout(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::NullProgress;

    fn uploadable_site(dir: &std::path::Path) -> UpdateSite {
        UpdateSite::new(
            "Test",
            "https://test.example/",
            Some("file:localhost".to_string()),
            Some(dir.to_string_lossy().to_string()),
            0,
        )
    }

    #[tokio::test]
    async fn registry_resolves_file_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let site = uploadable_site(dir.path());
        let transport = create_transport(&site).unwrap();
        assert_eq!(transport.protocol(), "file");
    }

    #[tokio::test]
    async fn unknown_protocol_is_unavailable() {
        let mut site = uploadable_site(std::path::Path::new("/tmp"));
        site.host = Some("carrier-pigeon:coop".to_string());
        let error = create_transport(&site).unwrap_err();
        assert_eq!(error.kind(), "transport-unavailable");
    }

    #[tokio::test]
    async fn lock_is_renamed_after_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let site = uploadable_site(dir.path());
        let mut transport = create_transport(&site).unwrap();
        transport.login(&site).await.unwrap();

        let payloads = vec![
            Payload::from_bytes("db.xml.gz.lock", b"catalog".to_vec()),
            Payload::from_bytes("macros/hello.ijm-20240101000000", b"macro".to_vec()),
        ];
        transport
            .upload(&payloads, &["db.xml.gz".to_string()], &mut NullProgress)
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("db.xml.gz")).unwrap(), b"catalog");
        assert!(!dir.path().join("db.xml.gz.lock").exists());
        assert!(dir
            .path()
            .join("macros/hello.ijm-20240101000000")
            .exists());
    }

    #[tokio::test]
    async fn existing_catalog_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("db.xml.gz"), b"previous").unwrap();
        let site = uploadable_site(dir.path());
        let mut transport = create_transport(&site).unwrap();

        let payloads = vec![Payload::from_bytes("db.xml.gz.lock", b"next".to_vec())];
        transport
            .upload(&payloads, &["db.xml.gz".to_string()], &mut NullProgress)
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("db.xml.gz")).unwrap(), b"next");
        assert_eq!(
            std::fs::read(dir.path().join("db.xml.gz.old")).unwrap(),
            b"previous"
        );
    }
}
