use std::path::PathBuf;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::catalog::fetch::file_url_path;
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::http::build_http_client;
use crate::core::progress::Progress;

/// One payload to move into the installation.
#[derive(Debug, Clone)]
pub struct Download {
    pub url: String,
    pub destination: PathBuf,
    /// Display name, usually the logical filename.
    pub name: String,
    pub expected_size: u64,
}

enum ChunkEvent {
    Progress(usize, usize),
}

/// Concurrent byte mover for the installer.
///
/// Workers stream payloads to their destinations in parallel; completions
/// come back to the driving task, which verifies each file as it lands.
/// The first failure aborts the whole batch; partial files stay behind in
/// the staging area for the next run to overwrite.
pub struct Downloader {
    concurrency: usize,
}

impl Default for Downloader {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

impl Downloader {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self { concurrency }
    }

    pub async fn download_batch<F>(
        &self,
        items: Vec<Download>,
        verify: F,
        progress: &mut dyn Progress,
    ) -> UpdaterResult<()>
    where
        F: Fn(&Download) -> UpdaterResult<()>,
    {
        if items.is_empty() {
            return Ok(());
        }
        let client = build_http_client()?;
        let total = items.len();
        progress.set_title("Downloading...");
        progress.set_count(0, total);

        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut downloads = futures::stream::iter(items.into_iter().map(move |item| {
            let client = client.clone();
            let events = events_tx.clone();
            async move {
                fetch_one(&client, &item, &events).await?;
                Ok::<Download, UpdaterError>(item)
            }
        }))
        .buffer_unordered(self.concurrency);

        let mut done = 0;
        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => {
                    let ChunkEvent::Progress(current, item_total) = event;
                    progress.set_item_count(current, item_total);
                }
                next = downloads.next() => match next {
                    Some(Ok(item)) => {
                        verify(&item)?;
                        done += 1;
                        progress.item_done(&item.name);
                        progress.set_count(done, total);
                    }
                    Some(Err(error)) => return Err(error),
                    None => break,
                },
            }
        }
        progress.done();
        Ok(())
    }
}

async fn fetch_one(
    client: &reqwest::Client,
    item: &Download,
    events: &tokio::sync::mpsc::UnboundedSender<ChunkEvent>,
) -> UpdaterResult<()> {
    if let Some(parent) = item.destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(UpdaterError::io(parent))?;
    }

    // file: URLs serve locally mounted sites (and the test suite).
    if let Some(source) = file_url_path(&item.url) {
        tokio::fs::copy(&source, &item.destination)
            .await
            .map_err(UpdaterError::io(&source))?;
        let _ = events.send(ChunkEvent::Progress(
            item.expected_size as usize,
            item.expected_size as usize,
        ));
        return Ok(());
    }

    let response = client
        .get(&item.url)
        .send()
        .await
        .map_err(|_| UpdaterError::NetworkUnavailable {
            url: item.url.clone(),
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(UpdaterError::DownloadFailed {
            url: item.url.clone(),
            status: status.as_u16(),
        });
    }
    let total = response.content_length().unwrap_or(item.expected_size) as usize;

    let mut file = tokio::fs::File::create(&item.destination)
        .await
        .map_err(UpdaterError::io(&item.destination))?;
    let mut stream = response.bytes_stream();
    let mut received = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(UpdaterError::io(&item.destination))?;
        received += chunk.len();
        let _ = events.send(ChunkEvent::Progress(received, total));
    }
    file.flush()
        .await
        .map_err(UpdaterError::io(&item.destination))?;
    drop(file);

    debug!("Downloaded {} -> {:?}", item.url, item.destination);
    Ok(())
}
