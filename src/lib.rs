// ─── Spectra Updater ───
// Reconciliation engine for the Spectra plug-in ecosystem.
//
// Architecture:
//   core/
//     platform    — OS/arch tags, launcher table, platform families
//     hasher      — content digests, archive filtering, legacy modes
//     model/      — sites, files, versions, statuses, the collection
//     catalog/    — db.xml.gz codec, remote index fetch, multi-site merge
//     scanner/    — local installation walk + checksum cache
//     deps/       — class-file scan → archive dependency sets
//     conflicts   — conflict detection + resolutions
//     download    — concurrent verified byte mover
//     installer   — staged downloads, atomic move-into-place
//     uploader/   — locked catalog swap through pluggable transports
//   commands/     — the CLI surface

pub mod commands;
pub mod core;
