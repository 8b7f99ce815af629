use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use gdrive_core::{DriveClient, DriveError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::RemoteEntry;
use super::paths::{PathError, local_child_path, sanitize_file_name};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("api error: {0}")]
    Drive(#[from] DriveError),
    #[error("stream failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unusable local name: {0}")]
    Path(#[from] PathError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

/// Writes the binary content of a remote entry into a local directory.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `entry` to `dest_dir/<sanitized name>`, replacing any file
    /// already there, and returns the sanitized name.
    async fn download(&self, entry: &RemoteEntry, dest_dir: &Path)
    -> Result<String, TransferError>;
}

#[derive(Clone)]
pub struct TransferClient {
    download_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new(download_concurrency: usize) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(download_concurrency.max(1))),
        }
    }

    pub async fn permit(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        self.download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)
    }

    /// Streams `response` into `target`. Bytes land in a partial sibling
    /// named after `target` and `tag` that is renamed over `target` only after
    /// the whole body was written; on any error the partial file is removed.
    /// Concurrent writes to one target must use distinct tags.
    pub async fn write_response(
        &self,
        response: reqwest::Response,
        target: &Path,
        tag: &str,
    ) -> Result<u64, TransferError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target, tag);
        match stream_into(response, &partial).await {
            Ok(written) => {
                if let Err(err) = tokio::fs::rename(&partial, target).await {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }
}

async fn stream_into(response: reqwest::Response, partial: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// [`Fetcher`] backed by the Drive media endpoint.
#[derive(Clone)]
pub struct DriveFetcher {
    client: DriveClient,
    transfer: TransferClient,
}

impl DriveFetcher {
    pub fn new(client: DriveClient, transfer: TransferClient) -> Self {
        Self { client, transfer }
    }
}

#[async_trait]
impl Fetcher for DriveFetcher {
    async fn download(
        &self,
        entry: &RemoteEntry,
        dest_dir: &Path,
    ) -> Result<String, TransferError> {
        let local_name = sanitize_file_name(&entry.name);
        let target = local_child_path(dest_dir, &local_name)?;
        let _permit = self.transfer.permit().await?;
        let response = self.client.download(&entry.id).await?;
        let bytes = self
            .transfer
            .write_response(response, &target, &entry.id)
            .await?;
        tracing::debug!(id = %entry.id, path = %target.display(), bytes, "wrote file");
        Ok(local_name)
    }
}

/// `<name>.<tag>.partial` next to `target`.
fn partial_path(target: &Path, tag: &str) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.partial", sanitize_file_name(tag)));
    target.with_file_name(name)
}
