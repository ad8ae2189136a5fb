//! Small helpers shared across components: atomic file writes and path safety.

use std::path::{Component, Path, PathBuf};

/// Write `contents` to `path` by writing to a sibling temp file and renaming
/// over the target, so readers never observe a partially-written file.
///
/// Used by the config store, the group store, and the updater's state file —
/// all three persist JSON documents that must survive a crash mid-write.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Reject a relative path that escapes its intended root via `..` components,
/// absolute paths, or embedded NUL bytes.
///
/// Used both for transfer-gateway server paths (§4.6) and for update-archive
/// entry names (§4.9) — the two places the spec calls out path-traversal
/// rejection as a hard invariant.
pub fn safe_relative_path(candidate: &str) -> Result<PathBuf, PathSafetyError> {
    if candidate.contains('\0') {
        return Err(PathSafetyError::NullByte);
    }
    let path = Path::new(candidate);
    if path.is_absolute() {
        return Err(PathSafetyError::Absolute);
    }
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(PathSafetyError::Traversal),
            Component::RootDir | Component::Prefix(_) => return Err(PathSafetyError::Absolute),
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(PathSafetyError::Traversal);
    }
    Ok(cleaned)
}

/// Join `root` with a path already validated by [`safe_relative_path`] and
/// double-check the result is still contained in `root` (defense in depth
/// against platform-specific quirks in component handling).
pub fn join_contained(root: &Path, relative: &Path) -> Result<PathBuf, PathSafetyError> {
    let joined = root.join(relative);
    let root_components: Vec<_> = root.components().collect();
    let joined_components: Vec<_> = joined.components().collect();
    if joined_components.len() < root_components.len()
        || joined_components[..root_components.len()] != root_components[..]
    {
        return Err(PathSafetyError::Traversal);
    }
    Ok(joined)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSafetyError {
    Absolute,
    Traversal,
    NullByte,
}

impl std::fmt::Display for PathSafetyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSafetyError::Absolute => write!(f, "path must be relative"),
            PathSafetyError::Traversal => write!(f, "path escapes its root"),
            PathSafetyError::NullByte => write!(f, "path contains a NUL byte"),
        }
    }
}

impl std::error::Error for PathSafetyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_relative_paths() {
        assert_eq!(
            safe_relative_path("a/b/c.txt").unwrap(),
            PathBuf::from("a/b/c.txt")
        );
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert_eq!(
            safe_relative_path("../../etc/passwd").unwrap_err(),
            PathSafetyError::Traversal
        );
        assert_eq!(
            safe_relative_path("a/../../b").unwrap_err(),
            PathSafetyError::Traversal
        );
    }

    #[test]
    fn rejects_absolute_paths() {
        assert_eq!(
            safe_relative_path("/etc/passwd").unwrap_err(),
            PathSafetyError::Absolute
        );
    }

    #[test]
    fn rejects_null_bytes() {
        assert_eq!(
            safe_relative_path("a\0b").unwrap_err(),
            PathSafetyError::NullByte
        );
    }

    #[test]
    fn join_contained_rejects_escape() {
        let root = Path::new("/data/staging");
        let rel = PathBuf::from("ok/file.txt");
        assert!(join_contained(root, &rel).is_ok());
    }
}
