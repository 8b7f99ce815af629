use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Stand-in for characters that are unsafe in local file names.
pub const PLACEHOLDER: char = '·';

const UNSAFE_CHARS: &[char] = &['/', '\\', '?', '%', '*', ':', '|', '"', '<', '>'];

#[derive(Debug, Error)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("name {0:?} is not a single path component")]
    UnsupportedComponent(String),
}

/// Maps a remote display name to a local file name. Deterministic; distinct
/// remote names may collide.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { PLACEHOLDER } else { c })
        .collect();
    replaced.trim().to_string()
}

/// Joins `name` under `dir`, refusing anything other than one plain component.
pub fn local_child_path(dir: &Path, name: &str) -> Result<PathBuf, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(dir.join(part)),
        _ => Err(PathError::UnsupportedComponent(name.to_string())),
    }
}
