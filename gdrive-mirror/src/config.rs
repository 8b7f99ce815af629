use std::path::PathBuf;

use gdrive_core::ServiceAccount;
use thiserror::Error;

pub const ENV_SERVICE_ACCOUNT_EMAIL: &str = "GOOGLE_SERVICE_ACCOUNT_EMAIL";
pub const ENV_PRIVATE_KEY: &str = "GOOGLE_PRIVATE_KEY";
pub const ENV_ROOT_FOLDER_ID: &str = "GOOGLE_DRIVE_FOLDER_ID";

const DEFAULT_PUBLIC_DIR: &str = "public";
const DEFAULT_STATE_FILE: &str = ".drive-sync-state.json";
const DEFAULT_INDEX_FILE: &str = "media-index.json";
const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;

/// Lowercase substrings; a top-level folder whose lowercased name contains
/// any of them is never listed or reconciled.
pub const EXCLUDED_FOLDER_PATTERNS: &[&str] = &["private", "draft", "archive"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
}

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub service_account: ServiceAccount,
    pub root_folder_id: String,
    pub public_dir: PathBuf,
    pub state_file: PathBuf,
    pub index_file: PathBuf,
    pub download_concurrency: usize,
    pub excluded_folder_patterns: Vec<String>,
}

impl MirrorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let client_email = required(ENV_SERVICE_ACCOUNT_EMAIL)?.trim().to_string();
        let private_key = normalize_private_key(&required(ENV_PRIVATE_KEY)?);
        let root_folder_id = required(ENV_ROOT_FOLDER_ID)?.trim().to_string();

        let path_or = |name: &str, default: &str| {
            PathBuf::from(
                lookup(name)
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| default.to_string()),
            )
        };
        let download_concurrency = lookup("MIRROR_DOWNLOAD_CONCURRENCY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_DOWNLOAD_CONCURRENCY);

        Ok(Self {
            service_account: ServiceAccount {
                client_email,
                private_key,
            },
            root_folder_id,
            public_dir: path_or("MIRROR_PUBLIC_DIR", DEFAULT_PUBLIC_DIR),
            state_file: path_or("MIRROR_STATE_FILE", DEFAULT_STATE_FILE),
            index_file: path_or("MIRROR_INDEX_FILE", DEFAULT_INDEX_FILE),
            download_concurrency,
            excluded_folder_patterns: EXCLUDED_FOLDER_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        })
    }

    pub fn is_excluded_folder(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.excluded_folder_patterns
            .iter()
            .any(|pattern| name.contains(pattern.as_str()))
    }
}

/// Keys pasted into a single-line env var usually carry literal `\n`.
fn normalize_private_key(raw: &str) -> String {
    raw.trim().trim_matches('"').replace("\\n", "\n")
}
