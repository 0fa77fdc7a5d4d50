mod common;

use common::{collection_for, write_local, SiteBuilder};
use spectra_updater::core::catalog::fetch;
use spectra_updater::core::hasher::{self, ArchiveFilter};
use spectra_updater::core::installer::Installer;
use spectra_updater::core::model::{Action, Status};
use spectra_updater::core::progress::NullProgress;
use spectra_updater::core::scanner;

const TS: u64 = 20240101000000;

#[tokio::test]
async fn fresh_install_of_a_single_file() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let contents = b"print('hello');\n";
    let checksum = site.payload("macros/hello.ijm", TS, contents);
    site.plugin("macros/hello.ijm", &checksum, TS, contents.len() as u64);
    site.write_catalog();

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    // Never seen before: the catalog offers it as a new file.
    assert_eq!(files.get("macros/hello.ijm").unwrap().status(), Status::New);
    assert!(files.stage_for_update("macros/hello.ijm", false).unwrap());

    let mut installer = Installer::new(&mut files);
    installer.start(&mut NullProgress).await.unwrap();
    installer.move_updated_into_place().unwrap();

    let record = files.get("macros/hello.ijm").unwrap();
    assert_eq!(record.status(), Status::Installed);
    assert_eq!(record.local_checksum.as_deref(), Some(checksum.as_str()));
    assert_eq!(
        std::fs::read(root.path().join("macros/hello.ijm")).unwrap(),
        contents
    );
    assert!(!root.path().join("update").exists());
}

#[tokio::test]
async fn local_modification_is_preserved() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let contents = b"print('hello');\n";
    let checksum = site.payload("macros/hello.ijm", TS, contents);
    site.plugin("macros/hello.ijm", &checksum, TS, contents.len() as u64);
    site.write_catalog();

    write_local(root.path(), "macros/hello.ijm", b"modified\n");

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    let record = files.get("macros/hello.ijm").unwrap();
    assert_eq!(record.status(), Status::Modified);
    assert_eq!(record.action(), Action::Modified);

    // Without force, the update pass refuses to stage it.
    assert!(!files.stage_for_update("macros/hello.ijm", false).unwrap());
    assert_eq!(
        std::fs::read(root.path().join("macros/hello.ijm")).unwrap(),
        b"modified\n"
    );
}

#[tokio::test]
async fn forced_update_overwrites_local_changes() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let contents = b"print('hello');\n";
    let checksum = site.payload("macros/hello.ijm", TS, contents);
    site.plugin("macros/hello.ijm", &checksum, TS, contents.len() as u64);
    site.write_catalog();

    write_local(root.path(), "macros/hello.ijm", b"modified\n");

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    assert!(files.stage_for_update("macros/hello.ijm", true).unwrap());
    let mut installer = Installer::new(&mut files);
    installer.start(&mut NullProgress).await.unwrap();
    installer.move_updated_into_place().unwrap();

    assert_eq!(
        std::fs::read(root.path().join("macros/hello.ijm")).unwrap(),
        contents
    );
    assert_eq!(
        files.get("macros/hello.ijm").unwrap().status(),
        Status::Installed
    );
}

#[tokio::test]
async fn legacy_archive_digests_are_accepted() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    // Build a jar whose raw digest differs from the filtered one.
    let jar_path = root.path().join("jars/lib.jar");
    std::fs::create_dir_all(jar_path.parent().unwrap()).unwrap();
    {
        use std::io::Write;
        let file = std::fs::File::create(&jar_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("build.properties", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"#Built on 2020-05-17\nversion=1\n").unwrap();
        writer.finish().unwrap();
    }
    let raw_digest = hasher::archive_digest(&jar_path, ArchiveFilter::RAW).unwrap();
    let current_digest = hasher::digest("jars/lib.jar", &jar_path).unwrap();
    assert_ne!(raw_digest, current_digest);

    // The catalog still records the raw-era digest.
    let filesize = std::fs::metadata(&jar_path).unwrap().len();
    let mut site = SiteBuilder::new(site_dir.path());
    site.plugin("jars/lib.jar", &raw_digest, TS, filesize);
    site.write_catalog();

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    assert_eq!(files.get("jars/lib.jar").unwrap().status(), Status::Installed);
}

#[tokio::test]
async fn update_stages_through_the_update_directory() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let old = b"old contents\n";
    let new = b"new contents\n";
    let old_checksum = site.payload("macros/m.ijm", TS, old);
    let new_ts = 20250101000000;
    let new_checksum = site.payload("macros/m.ijm", new_ts, new);
    site.plugin_xml(&format!(
        r#"    <plugin filename="macros/m.ijm">
        <version checksum="{new_checksum}" timestamp="{new_ts}" filesize="{}"/>
        <previous-version timestamp="{TS}" checksum="{old_checksum}"/>
    </plugin>"#,
        new.len()
    ));
    site.write_catalog();

    write_local(root.path(), "macros/m.ijm", old);

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    assert_eq!(files.get("macros/m.ijm").unwrap().status(), Status::Updateable);
    assert!(files.stage_for_update("macros/m.ijm", false).unwrap());

    // Staging downloads into update/ without touching the original.
    let mut installer = Installer::new(&mut files);
    installer.start(&mut NullProgress).await.unwrap();
    assert_eq!(
        std::fs::read(root.path().join("update/macros/m.ijm")).unwrap(),
        new
    );
    assert_eq!(std::fs::read(root.path().join("macros/m.ijm")).unwrap(), old);

    installer.move_updated_into_place().unwrap();
    assert_eq!(std::fs::read(root.path().join("macros/m.ijm")).unwrap(), new);
    assert!(!root.path().join("update").exists());
}

#[tokio::test]
async fn corrupted_download_aborts_the_batch() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let contents = b"print('hello');\n";
    let checksum = site.payload("macros/hello.ijm", TS, contents);
    // Advertise a wrong size: verification must fail.
    site.plugin("macros/hello.ijm", &checksum, TS, 9999);
    site.write_catalog();

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();
    files.stage_for_update("macros/hello.ijm", false).unwrap();

    let mut installer = Installer::new(&mut files);
    let error = installer.start(&mut NullProgress).await.unwrap_err();
    assert_eq!(error.kind(), "size-mismatch");
    assert!(!root.path().join("macros/hello.ijm").exists());
}

#[tokio::test]
async fn bundle_updates_bypass_staging_and_keep_a_backup() {
    let site_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();

    let mut site = SiteBuilder::new(site_dir.path());
    let new_binary = b"new binary\n";
    let checksum = site.payload("Spectra.app/Contents/MacOS/spectra", TS, new_binary);
    site.plugin(
        "Spectra.app/Contents/MacOS/spectra",
        &checksum,
        TS,
        new_binary.len() as u64,
    );
    site.write_catalog();

    write_local(
        root.path(),
        "Spectra.app/Contents/MacOS/spectra",
        b"old binary\n",
    );

    let mut files = collection_for(root.path(), &site);
    fetch::download_index(&mut files, &mut NullProgress).await.unwrap();
    scanner::checksum_all(&mut files, &mut NullProgress).unwrap();

    files
        .stage_for_update("Spectra.app/Contents/MacOS/spectra", true)
        .unwrap();
    let mut installer = Installer::new(&mut files);
    installer.start(&mut NullProgress).await.unwrap();

    // The whole bundle was backed up, and the download went directly to its
    // final location, not to update/.
    assert_eq!(
        std::fs::read(root.path().join("Spectra.old.app/Contents/MacOS/spectra")).unwrap(),
        b"old binary\n"
    );
    assert_eq!(
        std::fs::read(root.path().join("Spectra.app/Contents/MacOS/spectra")).unwrap(),
        new_binary
    );
    assert!(!root.path().join("update/Spectra.app").exists());
}
