use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::RemoteEntry;
use super::paths::local_child_path;
use super::state::{DirectoryState, FileRecord};
use super::transfer::Fetcher;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to create {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Counts for one reconciled directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub downloaded: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: &ReconcileReport) {
        self.downloaded += other.downloaded;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.removed += other.removed;
    }
}

pub struct Reconciler {
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(fetcher: Arc<dyn Fetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Brings `local_path` and `state` in line with `entries`, the complete
    /// listing of one remote directory.
    ///
    /// New or changed entries are downloaded; records whose id is no longer
    /// listed are removed together with their local file. A failed download
    /// leaves that entry's record untouched and does not stop the others.
    pub async fn reconcile(
        &self,
        entries: &[RemoteEntry],
        state: &mut DirectoryState,
        local_path: &Path,
    ) -> Result<ReconcileReport, ReconcileError> {
        tokio::fs::create_dir_all(local_path)
            .await
            .map_err(|source| ReconcileError::CreateDir {
                path: local_path.to_path_buf(),
                source,
            })?;

        let mut report = ReconcileReport::default();
        let remote_ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();

        let mut pending = Vec::new();
        for entry in entries {
            if entry.is_native_document() {
                report.skipped += 1;
                continue;
            }
            match state.get(&entry.id) {
                Some(record) if record.modified_time == entry.modified_time => {
                    report.unchanged += 1;
                }
                _ => pending.push(entry),
            }
        }

        let fetcher = &self.fetcher;
        let outcomes: Vec<_> = stream::iter(pending)
            .map(|entry| async move { (entry, fetcher.download(entry, local_path).await) })
            .buffered(self.concurrency)
            .collect()
            .await;

        // Names left behind by re-downloads; only checked once every record
        // of this batch is in place.
        let mut replaced = Vec::new();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(local_name) => {
                    let record = FileRecord {
                        local_name: local_name.clone(),
                        modified_time: entry.modified_time.clone(),
                        content_type: Some(entry.mime_type.clone()),
                    };
                    let previous = state.upsert(entry.id.clone(), record);
                    info!(dir = %local_path.display(), file = %local_name, "downloaded");
                    report.downloaded += 1;

                    if let Some(previous) = previous
                        && previous.local_name != local_name
                    {
                        replaced.push(previous.local_name);
                    }
                }
                Err(err) => {
                    warn!(id = %entry.id, name = %entry.name, error = %err, "download failed");
                    report.failed += 1;
                }
            }
        }
        for name in replaced {
            if !state.references_local_name(&name) {
                remove_local_file(local_path, &name).await;
            }
        }

        let stale: Vec<String> = state
            .files
            .keys()
            .filter(|id| !remote_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            let Some(record) = state.remove(&id) else {
                continue;
            };
            if !state.references_local_name(&record.local_name) {
                remove_local_file(local_path, &record.local_name).await;
            }
            info!(dir = %local_path.display(), file = %record.local_name, "removed");
            report.removed += 1;
        }

        Ok(report)
    }
}

async fn remove_local_file(dir: &Path, local_name: &str) {
    let path = match local_child_path(dir, local_name) {
        Ok(path) => path,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "refusing to remove recorded file");
            return;
        }
    };
    if let Err(err) = tokio::fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %err, "local file was not removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::paths::sanitize_file_name;
    use crate::sync::transfer::TransferError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeFetcher {
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
        delays_ms: Vec<(String, u64)>,
    }

    impl FakeFetcher {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn download(
            &self,
            entry: &RemoteEntry,
            dest_dir: &Path,
        ) -> Result<String, TransferError> {
            self.calls.lock().unwrap().push(entry.id.clone());
            if let Some((_, ms)) = self.delays_ms.iter().find(|(id, _)| *id == entry.id) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.failing.contains(&entry.id) {
                return Err(TransferError::Io(io::Error::other("connection reset")));
            }
            let name = sanitize_file_name(&entry.name);
            std::fs::write(dest_dir.join(&name), entry.modified_time.as_bytes())?;
            Ok(name)
        }
    }

    fn file(id: &str, name: &str, modified: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            name: name.into(),
            mime_type: "image/jpeg".into(),
            modified_time: modified.into(),
        }
    }

    fn doc(id: &str, name: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            name: name.into(),
            mime_type: "application/vnd.google-apps.document".into(),
            modified_time: "t0".into(),
        }
    }

    fn reconciler(fetcher: &Arc<FakeFetcher>) -> Reconciler {
        Reconciler::new(fetcher.clone(), 4)
    }

    #[tokio::test]
    async fn first_run_downloads_files_and_skips_native_documents() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("Photos");
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        let entries = vec![
            file("b", "b.jpg", "t1"),
            doc("d", "Notes"),
            file("a", "a.jpg", "t2"),
        ];

        let report = reconciler(&fetcher)
            .reconcile(&entries, &mut state, &local)
            .await
            .unwrap();

        assert_eq!(report.downloaded, 2);
        assert_eq!(report.skipped, 1);
        assert!(!fetcher.calls().contains(&"d".to_string()));
        assert!(state.get("d").is_none());
        let ids: Vec<_> = state.files.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(state.get("a").unwrap().modified_time, "t2");
        assert_eq!(
            state.get("a").unwrap().content_type.as_deref(),
            Some("image/jpeg")
        );
        assert!(local.join("a.jpg").exists());
    }

    #[tokio::test]
    async fn second_run_with_same_listing_does_nothing() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        let entries = vec![file("a", "a.jpg", "t1"), file("b", "b.jpg", "t1")];
        let reconciler = reconciler(&fetcher);

        reconciler
            .reconcile(&entries, &mut state, dir.path())
            .await
            .unwrap();
        let before = state.clone();
        let report = reconciler
            .reconcile(&entries, &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(report.downloaded, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn changed_timestamp_triggers_exactly_one_download() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        state.upsert(
            "a",
            FileRecord {
                local_name: "a.jpg".into(),
                modified_time: "2024-01-01T00:00:00.000Z".into(),
                content_type: None,
            },
        );
        state.upsert(
            "b",
            FileRecord {
                local_name: "b.jpg".into(),
                modified_time: "t1".into(),
                content_type: None,
            },
        );
        let entries = vec![
            file("a", "a.jpg", "2024-01-01T00:00:00.001Z"),
            file("b", "b.jpg", "t1"),
        ];

        let report = reconciler(&fetcher)
            .reconcile(&entries, &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), vec!["a".to_string()]);
        assert_eq!(report.downloaded, 1);
        assert_eq!(
            state.get("a").unwrap().modified_time,
            "2024-01-01T00:00:00.001Z"
        );
        let ids: Vec<_> = state.files.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_download_is_isolated_and_leaves_record_untouched() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::failing(&["bad", "stale"]));
        let mut state = DirectoryState::default();
        let stale_record = FileRecord {
            local_name: "stale.jpg".into(),
            modified_time: "old".into(),
            content_type: None,
        };
        state.upsert("stale", stale_record.clone());
        let entries = vec![
            file("bad", "bad.jpg", "t1"),
            file("stale", "stale.jpg", "new"),
            file("good", "good.jpg", "t1"),
        ];

        let report = reconciler(&fetcher)
            .reconcile(&entries, &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.downloaded, 1);
        assert!(state.get("bad").is_none());
        assert_eq!(state.get("stale"), Some(&stale_record));
        assert!(state.get("good").is_some());
        assert!(dir.path().join("good.jpg").exists());
    }

    #[tokio::test]
    async fn unlisted_records_are_removed_with_their_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("gone.jpg"), b"x").unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        for (id, name) in [("gone", "gone.jpg"), ("ghost", "ghost.jpg"), ("kept", "kept.jpg")] {
            state.upsert(
                id,
                FileRecord {
                    local_name: name.into(),
                    modified_time: "t1".into(),
                    content_type: None,
                },
            );
        }

        let report = reconciler(&fetcher)
            .reconcile(&[file("kept", "kept.jpg", "t1")], &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(report.removed, 2);
        assert!(!dir.path().join("gone.jpg").exists());
        let ids: Vec<_> = state.files.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["kept"]);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn rename_without_content_change_keeps_original_name() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        let reconciler = reconciler(&fetcher);
        reconciler
            .reconcile(&[file("a", "old.jpg", "t1")], &mut state, dir.path())
            .await
            .unwrap();

        let report = reconciler
            .reconcile(&[file("a", "new.jpg", "t1")], &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(report.downloaded, 0);
        assert_eq!(state.get("a").unwrap().local_name, "old.jpg");
        assert!(dir.path().join("old.jpg").exists());
    }

    #[tokio::test]
    async fn redownload_under_new_name_removes_previous_file() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        let reconciler = reconciler(&fetcher);
        reconciler
            .reconcile(&[file("a", "old.jpg", "t1")], &mut state, dir.path())
            .await
            .unwrap();

        reconciler
            .reconcile(&[file("a", "new.jpg", "t2")], &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(state.get("a").unwrap().local_name, "new.jpg");
        assert!(dir.path().join("new.jpg").exists());
        assert!(!dir.path().join("old.jpg").exists());
    }

    #[tokio::test]
    async fn previous_name_claimed_by_later_entry_is_kept() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        let reconciler = reconciler(&fetcher);
        reconciler
            .reconcile(&[file("a", "old.jpg", "t1")], &mut state, dir.path())
            .await
            .unwrap();

        let entries = vec![file("a", "new.jpg", "t2"), file("b", "old.jpg", "t3")];
        let report = reconciler
            .reconcile(&entries, &mut state, dir.path())
            .await
            .unwrap();

        assert_eq!(report.downloaded, 2);
        assert_eq!(state.get("a").unwrap().local_name, "new.jpg");
        assert_eq!(state.get("b").unwrap().local_name, "old.jpg");
        assert!(dir.path().join("new.jpg").exists());
        assert_eq!(std::fs::read(dir.path().join("old.jpg")).unwrap(), b"t3");
    }

    #[tokio::test]
    async fn concurrent_downloads_keep_listing_order() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            delays_ms: vec![("1".into(), 60), ("2".into(), 30), ("3".into(), 0)],
            ..FakeFetcher::default()
        });
        let mut state = DirectoryState::default();
        let entries = vec![
            file("1", "one.jpg", "t"),
            file("2", "two.jpg", "t"),
            file("3", "three.jpg", "t"),
        ];

        reconciler(&fetcher)
            .reconcile(&entries, &mut state, dir.path())
            .await
            .unwrap();

        let ids: Vec<_> = state.files.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn refuses_to_delete_outside_directory() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("Photos");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"keep").unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut state = DirectoryState::default();
        state.upsert(
            "x",
            FileRecord {
                local_name: "../secret.txt".into(),
                modified_time: "t".into(),
                content_type: None,
            },
        );

        let report = reconciler(&fetcher)
            .reconcile(&[], &mut state, &local)
            .await
            .unwrap();

        assert_eq!(report.removed, 1);
        assert!(state.is_empty());
        assert!(dir.path().join("secret.txt").exists());
    }
}
