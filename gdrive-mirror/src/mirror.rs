use std::collections::HashSet;
use std::sync::Arc;

use gdrive_core::{AuthError, DRIVE_READONLY_SCOPE, DriveClient, DriveError, ServiceAccountAuth};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::sync::RemoteEntry;
use crate::sync::media_index::{MediaIndex, ROOT_KEY, build_index, write_index};
use crate::sync::paths::local_child_path;
use crate::sync::reconcile::{ReconcileError, ReconcileReport, Reconciler};
use crate::sync::state::{LoadOutcome, StateError, SyncState, load_state, save_state};
use crate::sync::transfer::{DriveFetcher, Fetcher, TransferClient};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("remote listing failed: {0}")]
    Drive(#[from] DriveError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub directories: Vec<(String, ReconcileReport)>,
    pub skipped_folders: Vec<String>,
}

impl RunSummary {
    pub fn totals(&self) -> ReconcileReport {
        let mut totals = ReconcileReport::default();
        for (_, report) in &self.directories {
            totals.merge(report);
        }
        totals
    }
}

pub struct MirrorRuntime {
    config: MirrorConfig,
    client: DriveClient,
    reconciler: Reconciler,
}

impl MirrorRuntime {
    /// Exchanges the service-account key for an access token and builds the
    /// client around it. The token is not refreshed; Google issues it for
    /// one hour, so a runtime is meant for a single [`run`](Self::run) and a
    /// run that outlasts the token fails its remaining calls with 401.
    pub async fn bootstrap(config: MirrorConfig) -> Result<Self, MirrorError> {
        let auth = ServiceAccountAuth::new(config.service_account.clone())?;
        let token = auth.fetch_token(DRIVE_READONLY_SCOPE).await?;
        let client = DriveClient::new(token.access_token)?;
        Ok(Self::from_parts(config, client))
    }

    pub fn from_parts(config: MirrorConfig, client: DriveClient) -> Self {
        let transfer = TransferClient::new(config.download_concurrency);
        let fetcher = DriveFetcher::new(client.clone(), transfer);
        let reconciler = Reconciler::new(Arc::new(fetcher), config.download_concurrency);
        Self {
            config,
            client,
            reconciler,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.reconciler = Reconciler::new(fetcher, self.config.download_concurrency);
        self
    }

    /// Mirrors the configured remote folder once. State and index are only
    /// written after every directory was listed and reconciled.
    pub async fn run(&self) -> Result<RunSummary, MirrorError> {
        let mut state = load_existing_state(&self.config).await?;
        let mut summary = RunSummary::default();

        let top_level = self
            .list_folder(&self.config.root_folder_id, ROOT_KEY)
            .await?;
        let (folders, loose): (Vec<RemoteEntry>, Vec<RemoteEntry>) =
            top_level.into_iter().partition(|entry| entry.is_folder());
        let loose: Vec<RemoteEntry> = loose
            .into_iter()
            .filter(|entry| !entry.is_native_document())
            .collect();

        let mut seen = HashSet::new();
        for folder in &folders {
            if self.config.is_excluded_folder(&folder.name) {
                info!(folder = %folder.name, "skipping excluded folder");
                summary.skipped_folders.push(folder.name.clone());
                continue;
            }
            if folder.name == ROOT_KEY || !seen.insert(folder.name.as_str()) {
                warn!(folder = %folder.name, id = %folder.id, "skipping folder with conflicting name");
                summary.skipped_folders.push(folder.name.clone());
                continue;
            }
            let local = match local_child_path(&self.config.public_dir, &folder.name) {
                Ok(local) => local,
                Err(err) => {
                    warn!(folder = %folder.name, error = %err, "skipping folder with unusable name");
                    summary.skipped_folders.push(folder.name.clone());
                    continue;
                }
            };

            let children = self.list_folder(&folder.id, &folder.name).await?;
            debug!(folder = %folder.name, entries = children.len(), "listed folder");
            let report = self
                .reconciler
                .reconcile(&children, state.directory_mut(&folder.name), &local)
                .await?;
            summary.directories.push((folder.name.clone(), report));
        }

        let report = self
            .reconciler
            .reconcile(&loose, state.directory_mut(ROOT_KEY), &self.config.public_dir)
            .await?;
        summary.directories.push((ROOT_KEY.to_string(), report));

        save_state(&self.config.state_file, &state).await?;
        write_index(&self.config.index_file, &build_index(&state)).await?;

        let totals = summary.totals();
        info!(
            downloaded = totals.downloaded,
            removed = totals.removed,
            unchanged = totals.unchanged,
            failed = totals.failed,
            skipped_folders = summary.skipped_folders.len(),
            "sync finished"
        );
        Ok(summary)
    }

    async fn list_folder(&self, id: &str, label: &str) -> Result<Vec<RemoteEntry>, DriveError> {
        self.client.list_children(id).await.inspect_err(|err| {
            warn!(
                folder = label,
                class = ?err.classification(),
                retryable = err.is_retryable(),
                error = %err,
                "listing failed, aborting run"
            );
        })
    }
}

/// Regenerates the index from the persisted state without remote calls.
pub async fn rebuild_index(config: &MirrorConfig) -> Result<MediaIndex, MirrorError> {
    let state = load_existing_state(config).await?;
    let index = build_index(&state);
    write_index(&config.index_file, &index).await?;
    Ok(index)
}

async fn load_existing_state(config: &MirrorConfig) -> Result<SyncState, MirrorError> {
    let outcome = load_state(&config.state_file).await?;
    match &outcome {
        LoadOutcome::Loaded(state) => {
            debug!(path = %config.state_file.display(), dirs = state.dirs.len(), "loaded state");
        }
        LoadOutcome::Absent => {
            info!(path = %config.state_file.display(), "no previous state, starting fresh");
        }
        LoadOutcome::Corrupt(reason) => {
            warn!(path = %config.state_file.display(), %reason, "state file unreadable, starting fresh");
        }
    }
    Ok(outcome.into_state())
}
