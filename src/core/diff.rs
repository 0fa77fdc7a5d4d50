use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use zip::ZipArchive;

use crate::core::catalog::fetch::file_url_path;
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::http::build_http_client;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Compare the entry lists of archive bundles (sizes included).
    ListFiles,
    /// Report the first differing byte range as a hex excerpt.
    HexDiff,
}

/// Print how the remote version of a file differs from the local copy.
pub async fn show_diff(
    out: &mut dyn Write,
    filename: &str,
    remote_url: &str,
    local: &std::path::Path,
    mode: DiffMode,
) -> UpdaterResult<()> {
    let remote_bytes = fetch_bytes(remote_url).await?;
    let local_bytes = std::fs::read(local).map_err(UpdaterError::io(local))?;

    writeln!(out, "diff {filename}")?;
    if remote_bytes == local_bytes {
        writeln!(out, "  identical")?;
        return Ok(());
    }

    match mode {
        DiffMode::ListFiles if filename.ends_with(".jar") => {
            let remote_entries = archive_entries(&remote_bytes)?;
            let local_entries = archive_entries(&local_bytes)?;
            for (name, size) in &remote_entries {
                match local_entries.get(name) {
                    None => writeln!(out, "  +{name} ({size} bytes)")?,
                    Some(local_size) if local_size != size => {
                        writeln!(out, "  ~{name} ({local_size} -> {size} bytes)")?
                    }
                    Some(_) => {}
                }
            }
            for name in local_entries.keys() {
                if !remote_entries.contains_key(name) {
                    writeln!(out, "  -{name}")?;
                }
            }
        }
        _ => {
            let offset = remote_bytes
                .iter()
                .zip(local_bytes.iter())
                .position(|(a, b)| a != b)
                .unwrap_or_else(|| remote_bytes.len().min(local_bytes.len()));
            writeln!(
                out,
                "  sizes: local {} bytes, remote {} bytes; first difference at offset {offset}",
                local_bytes.len(),
                remote_bytes.len()
            )?;
            writeln!(out, "  local:  {}", hex_excerpt(&local_bytes, offset))?;
            writeln!(out, "  remote: {}", hex_excerpt(&remote_bytes, offset))?;
        }
    }
    Ok(())
}

async fn fetch_bytes(url: &str) -> UpdaterResult<Vec<u8>> {
    if let Some(path) = file_url_path(url) {
        return std::fs::read(&path).map_err(UpdaterError::io(&path));
    }
    let client = build_http_client()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(UpdaterError::DownloadFailed {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    Ok(response.bytes().await?.to_vec())
}

fn archive_entries(bytes: &[u8]) -> UpdaterResult<BTreeMap<String, u64>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut result = BTreeMap::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        result.insert(entry.name().to_string(), entry.size());
    }
    Ok(result)
}

fn hex_excerpt(bytes: &[u8], offset: usize) -> String {
    let end = (offset + 16).min(bytes.len());
    if offset >= bytes.len() {
        return "<end of file>".to_string();
    }
    hex::encode(&bytes[offset..end])
}
