mod common;

use common::{write_local, SiteBuilder};
use spectra_updater::core::catalog::{fetch, gunzip, reader, writer};
use spectra_updater::core::model::{FilesCollection, Status};
use spectra_updater::core::progress::NullProgress;
use spectra_updater::core::scanner;
use spectra_updater::core::uploader::FilesUploader;
use spectra_updater::core::util;

/// A collection whose default site is uploadable through the `file:`
/// transport, rooted in `root` and served from `site`.
fn uploadable_collection(root: &std::path::Path, site: &SiteBuilder) -> FilesCollection {
    let mut files = FilesCollection::new(root);
    let url = site.url();
    let dir = site.dir.to_string_lossy().to_string();
    let record = files.get_site_mut("Spectra").expect("default site");
    record.set_url(url);
    record.host = Some("file:localhost".to_string());
    record.set_upload_directory(Some(dir));
    files
}

#[tokio::test]
async fn uploading_a_local_only_file_publishes_it() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let site = SiteBuilder::new(site_dir.path());
    write_local(root.path(), "macros/mine.ijm", b"my macro\n");

    let mut files = uploadable_collection(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();
    assert_eq!(files.get("macros/mine.ijm").unwrap().status(), Status::LocalOnly);

    files.stage_for_upload("macros/mine.ijm", "Spectra").unwrap();
    let mut uploader = FilesUploader::new(&mut files, "Spectra").unwrap();
    uploader.login().await.unwrap();
    uploader.upload(&mut NullProgress).await.unwrap();
    writer::write_local(&mut files).unwrap();

    // The remote catalog now advertises the file under a versioned name.
    let compressed = std::fs::read(site_dir.path().join("db.xml.gz")).unwrap();
    let xml = gunzip(&compressed).unwrap();
    let text = String::from_utf8_lossy(&xml).to_string();
    assert!(text.contains("macros/mine.ijm"));

    let timestamp = files.get("macros/mine.ijm").unwrap().local_timestamp;
    assert!(site_dir
        .path()
        .join(format!("macros/mine.ijm-{timestamp}"))
        .exists());
    assert!(!site_dir.path().join("db.xml.gz.lock").exists());

    // A fresh client sees the published file as installable.
    let other_root = tempfile::tempdir().unwrap();
    let mut other = uploadable_collection(other_root.path(), &site);
    fetch::download_index(&mut other, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut other, &mut NullProgress).unwrap();
    let record = other.get("macros/mine.ijm").unwrap();
    assert!(record.current.is_some());
    assert_eq!(
        record.current.as_ref().map(|version| version.timestamp),
        Some(timestamp)
    );
}

#[tokio::test]
async fn site_skew_aborts_before_any_write() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let checksum = site.payload("macros/published.ijm", 20240101000000, b"published\n");
    site.plugin("macros/published.ijm", &checksum, 20240101000000, 10);
    site.write_catalog();
    let catalog_before = std::fs::read(site_dir.path().join("db.xml.gz")).unwrap();

    write_local(root.path(), "macros/mine.ijm", b"my macro\n");

    let mut files = uploadable_collection(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();
    files.stage_for_upload("macros/mine.ijm", "Spectra").unwrap();

    // Somebody else publishes between our read and our upload.
    let future = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() + 120,
        0,
    );
    filetime::set_file_mtime(site_dir.path().join("db.xml.gz"), future).unwrap();

    let mut uploader = FilesUploader::new(&mut files, "Spectra").unwrap();
    uploader.login().await.unwrap();
    let error = uploader.upload(&mut NullProgress).await.unwrap_err();
    assert_eq!(error.kind(), "site-skew");

    // Nothing was renamed into place remotely.
    assert_eq!(
        std::fs::read(site_dir.path().join("db.xml.gz")).unwrap(),
        catalog_before
    );
    assert!(!site_dir.path().join("db.xml.gz.lock").exists());
    let timestamp = files.get("macros/mine.ijm").unwrap().local_timestamp;
    assert!(!site_dir
        .path()
        .join(format!("macros/mine.ijm-{timestamp}"))
        .exists());
}

#[tokio::test]
async fn payload_changing_mid_upload_is_a_timestamp_skew() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let site = SiteBuilder::new(site_dir.path());
    write_local(root.path(), "macros/mine.ijm", b"my macro\n");

    let mut files = uploadable_collection(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();
    files.stage_for_upload("macros/mine.ijm", "Spectra").unwrap();

    // The file changes after checksumming: the upload conflict pass
    // catches it before any byte moves.
    let future = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() + 120,
        0,
    );
    filetime::set_file_mtime(root.path().join("macros/mine.ijm"), future).unwrap();

    let mut uploader = FilesUploader::new(&mut files, "Spectra").unwrap();
    uploader.login().await.unwrap();
    let error = uploader.upload(&mut NullProgress).await.unwrap_err();
    assert_eq!(error.kind(), "conflicts");
}

#[tokio::test]
async fn removal_unshadows_through_upload() {
    // Site A (rank 0) and site B (rank 1) both carry the file; removing it
    // from B must fall back to A's record.
    let site_a_dir = tempfile::tempdir().unwrap();
    let site_b_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site_a = SiteBuilder::new(site_a_dir.path());
    let checksum_a = site_a.payload("macros/m.ijm", 20230101000000, b"version A\n");
    site_a.plugin("macros/m.ijm", &checksum_a, 20230101000000, 10);
    site_a.write_catalog();

    let mut site_b = SiteBuilder::new(site_b_dir.path());
    let checksum_b = site_b.payload("macros/m.ijm", 20240101000000, b"version B\n");
    site_b.plugin("macros/m.ijm", &checksum_b, 20240101000000, 10);
    site_b.write_catalog();

    write_local(root.path(), "macros/m.ijm", b"version B\n");

    let mut files = FilesCollection::new(root.path());
    files
        .get_site_mut("Spectra")
        .expect("default site")
        .set_url(site_a.url());
    let extras = files.add_update_site("Extras", &site_b.url(), None, None, 0);
    extras.host = Some("file:localhost".to_string());
    let dir = site_b.dir.to_string_lossy().to_string();
    files
        .get_site_mut("Extras")
        .expect("just added")
        .set_upload_directory(Some(dir));

    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    let record = files.get("macros/m.ijm").unwrap();
    assert_eq!(record.update_site.as_deref(), Some("Extras"));
    assert!(record.overrides_other_site());

    // Remove is allowed on the shadowing entry despite INSTALLED status.
    files
        .set_action("macros/m.ijm", spectra_updater::core::model::Action::Remove)
        .unwrap();

    let mut uploader = FilesUploader::new(&mut files, "Extras").unwrap();
    uploader.login().await.unwrap();
    uploader.upload(&mut NullProgress).await.unwrap();

    // Ownership reverted to site A.
    let record = files.get("macros/m.ijm").unwrap();
    assert_eq!(record.update_site.as_deref(), Some("Spectra"));

    // The published catalog no longer advertises a current version.
    let compressed = std::fs::read(site_b_dir.path().join("db.xml.gz")).unwrap();
    let xml = gunzip(&compressed).unwrap();
    let mut republished = FilesCollection::new(root.path());
    republished.add_update_site("Extras", &site_b.url(), None, None, 0);
    reader::read(&mut republished, Some("Extras"), &xml).unwrap();
    let republished_record = republished.get("macros/m.ijm").unwrap();
    assert!(republished_record.current.is_none());
    assert!(republished_record
        .previous
        .iter()
        .any(|version| version.checksum == checksum_b));
}

#[test]
fn timestamps_are_fourteen_digits() {
    let now = util::current_timestamp();
    assert_eq!(now.to_string().len(), 14);
}
