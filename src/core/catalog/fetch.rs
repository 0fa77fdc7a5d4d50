use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use reqwest::header::LAST_MODIFIED;
use tracing::{debug, warn};

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::http::build_http_client;
use crate::core::model::FilesCollection;
use crate::core::progress::Progress;
use crate::core::util;

/// Re-read the catalog of every active site, merging by rank.
///
/// Network failures degrade to warnings (status checks treat an unreachable
/// site as up-to-date), but the returned warning string lets mutating
/// callers refuse to proceed.
pub async fn download_index(
    files: &mut FilesCollection,
    progress: &mut dyn Progress,
) -> UpdaterResult<String> {
    let site_names = files.site_names(false);
    if site_names.is_empty() {
        return Ok(String::new());
    }
    progress.set_title("Updating the index of available files");
    let total = site_names.len();
    let mut warnings = String::new();

    for (count, name) in site_names.into_iter().enumerate() {
        let Some(site) = files.get_site(&name, true) else {
            continue;
        };
        let url = format!("{}{}", site.url(), util::XML_COMPRESSED);
        let title = format!("Updating from site '{name}': {url}");
        progress.add_item(&title);
        progress.set_count(count, total);

        match fetch_catalog(&url).await {
            Ok(Some((bytes, last_modified))) => {
                let xml = match super::gunzip(&bytes) {
                    Ok(xml) => xml,
                    Err(error) => {
                        warnings.push_str(&format!(
                            "Could not update from site '{name}': {error}\n"
                        ));
                        progress.item_done(&title);
                        continue;
                    }
                };
                if let Err(error) = super::reader::read(files, Some(&name), &xml) {
                    warnings.push_str(&format!("Could not update from site '{name}': {error}\n"));
                } else if let Some(site) = files.get_site_mut(&name) {
                    site.set_last_modified(last_modified);
                }
            }
            Ok(None) => {
                // The catalog was deleted remotely.
                debug!("Site '{name}' has no catalog at {url}");
                if let Some(site) = files.get_site_mut(&name) {
                    site.timestamp = 0;
                }
            }
            Err(error) => {
                warn!("Could not update from site '{name}': {error}");
                warnings.push_str(&format!("Could not update from site '{name}': {error}\n"));
            }
        }
        progress.item_done(&title);
    }
    progress.done();
    Ok(warnings)
}

/// Fetch a site's compressed catalog: the bytes plus the server-side
/// last-modified time in epoch milliseconds. `Ok(None)` means the catalog
/// does not exist (yet).
async fn fetch_catalog(url: &str) -> UpdaterResult<Option<(Vec<u8>, i64)>> {
    if let Some(path) = file_url_path(url) {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(UpdaterError::io(&path))?;
        return Ok(Some((bytes, mtime_millis(&path)?)));
    }

    let client = build_http_client()?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|_| UpdaterError::NetworkUnavailable {
            url: url.to_string(),
        })?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if status == reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Err(UpdaterError::ProxyAuthRequired);
    }
    if !status.is_success() {
        return Err(UpdaterError::DownloadFailed {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let last_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
        .unwrap_or(0);
    let bytes = response.bytes().await?;
    Ok(Some((bytes.to_vec(), last_modified)))
}

/// Last-modified time of a remote resource in epoch milliseconds;
/// `Ok(None)` when the resource does not exist.
pub async fn remote_last_modified(url: &str) -> UpdaterResult<Option<i64>> {
    if let Some(path) = file_url_path(url) {
        if !path.exists() {
            return Ok(None);
        }
        return Ok(Some(mtime_millis(&path)?));
    }

    let client = build_http_client()?;
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|_| UpdaterError::NetworkUnavailable {
            url: url.to_string(),
        })?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    Ok(Some(
        response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date)
            .unwrap_or(0),
    ))
}

/// `file:` URLs address locally mounted site roots; used heavily by tests.
pub fn file_url_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:"))?;
    Some(PathBuf::from(rest))
}

fn mtime_millis(path: &std::path::Path) -> UpdaterResult<i64> {
    let metadata = std::fs::metadata(path).map_err(UpdaterError::io(path))?;
    let modified = metadata.modified().map_err(UpdaterError::io(path))?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0);
    Ok(millis)
}

fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_urls_resolve_to_paths() {
        assert_eq!(
            file_url_path("file:///srv/site/db.xml.gz"),
            Some(PathBuf::from("/srv/site/db.xml.gz"))
        );
        assert_eq!(
            file_url_path("file:/srv/site/db.xml.gz"),
            Some(PathBuf::from("/srv/site/db.xml.gz"))
        );
        assert_eq!(file_url_path("https://example.org/db.xml.gz"), None);
    }

    #[test]
    fn http_dates_parse() {
        let millis = parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert!(millis > 0);
    }
}
