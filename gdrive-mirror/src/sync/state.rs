use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the engine last synced for one remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Sanitized name on disk, fixed at download time.
    #[serde(rename = "name")]
    pub local_name: String,
    /// Watermark compared verbatim against the remote `modifiedTime`.
    #[serde(rename = "modifiedTime")]
    pub modified_time: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryState {
    #[serde(default)]
    pub files: IndexMap<String, FileRecord>,
}

impl DirectoryState {
    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.files.get(id)
    }

    /// Inserts or replaces a record. Replacing keeps the record's position.
    pub fn upsert(&mut self, id: impl Into<String>, record: FileRecord) -> Option<FileRecord> {
        self.files.insert(id.into(), record)
    }

    /// Removes a record without disturbing the order of the others.
    pub fn remove(&mut self, id: &str) -> Option<FileRecord> {
        self.files.shift_remove(id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn references_local_name(&self, local_name: &str) -> bool {
        self.files.values().any(|r| r.local_name == local_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub dirs: IndexMap<String, DirectoryState>,
}

impl SyncState {
    pub fn directory_mut(&mut self, key: &str) -> &mut DirectoryState {
        self.dirs.entry(key.to_string()).or_default()
    }

    pub fn directory(&self, key: &str) -> Option<&DirectoryState> {
        self.dirs.get(key)
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(SyncState),
    Absent,
    Corrupt(String),
}

impl LoadOutcome {
    pub fn into_state(self) -> SyncState {
        match self {
            LoadOutcome::Loaded(state) => state,
            LoadOutcome::Absent | LoadOutcome::Corrupt(_) => SyncState::default(),
        }
    }
}

/// Reads the persisted state. A missing or undecodable file is reported
/// through [`LoadOutcome`]; other I/O failures are errors.
pub async fn load_state(path: &Path) -> Result<LoadOutcome, StateError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LoadOutcome::Absent),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    match serde_json::from_slice::<SyncState>(&bytes) {
        Ok(state) => Ok(LoadOutcome::Loaded(state)),
        Err(err) => Ok(LoadOutcome::Corrupt(err.to_string())),
    }
}

pub async fn save_state(path: &Path, state: &SyncState) -> Result<(), StateError> {
    let encoded = serde_json::to_vec_pretty(state)?;
    write_atomic(path, &encoded).await
}

/// Writes `contents` to a sibling temp file and renames it over `path`, so
/// readers see either the old document or the new one.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = tmp_path(path);
    let write = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    };
    if let Err(err) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(err));
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
