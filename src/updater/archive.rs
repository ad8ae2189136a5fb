//! Archive extraction for downloaded update payloads (§4.9).
//!
//! Accepts both `.tar.gz` and `.zip` assets (gawd's own release pipeline
//! ships both depending on target). Every entry name is run through
//! [`crate::util::safe_relative_path`] before being written, and symlink
//! entries are rejected outright — an archive is attacker-influenced input
//! the moment it is fetched from a third-party manifest URL.

use std::path::Path;

use crate::util::{join_contained, safe_relative_path};

#[derive(Debug)]
pub struct ArchiveError(String);

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError(e.to_string())
    }
}

/// Extract `archive_path` into `dest_dir`, dispatching on file extension.
/// Runs the actual (blocking, sync-crate) extraction on a blocking thread
/// since neither `tar` nor `zip` is async.
pub async fn extract(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    let is_zip = archive_path.extension().and_then(|e| e.to_str()) == Some("zip");

    tokio::task::spawn_blocking(move || {
        if is_zip {
            extract_zip(&archive_path, &dest_dir)
        } else {
            extract_tar_gz(&archive_path, &dest_dir)
        }
    })
    .await
    .map_err(|e| ArchiveError(e.to_string()))?
}

fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header();
        if header.entry_type().is_symlink() || header.entry_type().is_hard_link() {
            return Err(ArchiveError("archive entry is a link, refusing to extract".to_string()));
        }
        let raw_name = entry.path()?.to_string_lossy().into_owned();
        let relative = safe_relative_path(&raw_name)
            .map_err(|e| ArchiveError(format!("unsafe archive entry {raw_name:?}: {e}")))?;
        let target = join_contained(dest_dir, &relative)
            .map_err(|e| ArchiveError(format!("unsafe archive entry {raw_name:?}: {e}")))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ArchiveError(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ArchiveError(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let raw_name = entry.name().to_string();
        let relative = safe_relative_path(&raw_name)
            .map_err(|e| ArchiveError(format!("unsafe archive entry {raw_name:?}: {e}")))?;
        let target = join_contained(dest_dir, &relative)
            .map_err(|e| ArchiveError(format!("unsafe archive entry {raw_name:?}: {e}")))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
            }
        }
    }
    Ok(())
}

/// Clear the macOS quarantine attribute from an extracted binary so the
/// staged executable can run without a Gatekeeper prompt. A no-op (and never
/// an error) on non-macOS targets.
#[cfg(target_os = "macos")]
pub fn clear_quarantine(path: &Path) {
    let _ = std::process::Command::new("xattr")
        .args(["-d", "com.apple.quarantine"])
        .arg(path)
        .status();
}

#[cfg(not(target_os = "macos"))]
pub fn clear_quarantine(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extract_tar_gz_rejects_path_traversal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "../../etc/passwd", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("staging");
        tokio::fs::create_dir_all(&dest).await.unwrap();
        let result = extract(&archive_path, &dest).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn extract_tar_gz_writes_ordinary_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("ok.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"binary contents";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "bin/xxtc-hub", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("staging");
        tokio::fs::create_dir_all(&dest).await.unwrap();
        extract(&archive_path, &dest).await.unwrap();
        let written = tokio::fs::read(dest.join("bin/xxtc-hub")).await.unwrap();
        assert_eq!(written, b"binary contents");
    }
}
