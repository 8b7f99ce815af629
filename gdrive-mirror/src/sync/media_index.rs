use std::path::Path;

use indexmap::IndexMap;

use super::state::{StateError, SyncState, write_atomic};

/// Directory key reserved for loose files at the top of the remote root.
pub const ROOT_KEY: &str = "root";

/// Directory key to the public paths of its files, in record order.
pub type MediaIndex = IndexMap<String, Vec<String>>;

/// Derives the index from `state` alone. Files under [`ROOT_KEY`] are served
/// from `/`, every other directory from `/<key>/`.
pub fn build_index(state: &SyncState) -> MediaIndex {
    state
        .dirs
        .iter()
        .map(|(key, dir)| {
            let paths = dir
                .files
                .values()
                .map(|record| public_path(key, &record.local_name))
                .collect();
            (key.clone(), paths)
        })
        .collect()
}

fn public_path(key: &str, local_name: &str) -> String {
    if key == ROOT_KEY {
        format!("/{local_name}")
    } else {
        format!("/{key}/{local_name}")
    }
}

pub async fn write_index(path: &Path, index: &MediaIndex) -> Result<(), StateError> {
    let encoded = serde_json::to_vec_pretty(index)?;
    write_atomic(path, &encoded).await
}
