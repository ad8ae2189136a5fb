//! Large-File Transfer Gateway (C7).
//!
//! Mints one-shot HTTP tokens for pushing a server-side file to a device or
//! pulling a device-side file onto the server, and coordinates the matching
//! device command. Grounded on the teacher's `gawdxfer::manager::TransferManager`
//! for its file-I/O primitives (streaming hash, path validation, atomic
//! rename, disk-space check, stale sweep) — simplified from the teacher's
//! chunked/resumable protocol down to the spec's single-shot streaming body,
//! since §4.6 tokens are one-shot rather than chunked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::util::{self, safe_relative_path};

/// Token lifetime (§4.6 "Expiration default: 300 s").
pub const TOKEN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Push,
    Pull,
}

pub struct TransferToken {
    pub kind: TokenKind,
    pub device_udid: String,
    pub server_path: PathBuf,
    pub device_path: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    expires_at: Instant,
    consumed: AtomicBool,
    shared_source_id: Option<String>,
}

impl TransferToken {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Atomically claim this token for consumption. Returns `true` exactly
    /// once across any number of concurrent callers (§3, §8 invariant 5).
    fn try_consume(&self) -> bool {
        !self.is_expired() && self.consumed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}

struct SharedSource {
    path: PathBuf,
    refcount: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    NotFound,
    Expired,
    AlreadyConsumed,
    Io,
    InvalidPath,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::NotFound => write!(f, "token not found"),
            TransferError::Expired => write!(f, "token expired"),
            TransferError::AlreadyConsumed => write!(f, "token already consumed"),
            TransferError::Io => write!(f, "I/O error"),
            TransferError::InvalidPath => write!(f, "invalid path"),
        }
    }
}

impl std::error::Error for TransferError {}

#[derive(Debug, Clone, Serialize)]
pub struct PushMinted {
    pub token: String,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    pub md5: String,
}

pub struct TransferManager {
    files_root: PathBuf,
    scripts_root: PathBuf,
    reports_root: PathBuf,
    tokens: RwLock<HashMap<String, Arc<TransferToken>>>,
    shared_sources: RwLock<HashMap<String, SharedSource>>,
    active_count: AtomicU32,
}

impl TransferManager {
    #[must_use]
    pub fn new(files_root: PathBuf, scripts_root: PathBuf, reports_root: PathBuf) -> Self {
        Self {
            files_root,
            scripts_root,
            reports_root,
            tokens: RwLock::new(HashMap::new()),
            shared_sources: RwLock::new(HashMap::new()),
            active_count: AtomicU32::new(0),
        }
    }

    /// Resolve which root a `category` refers to (§4.6: `push-to-device` /
    /// `pull-from-device` both carry a `category` alongside `path`). Unknown
    /// categories fall back to the general file store.
    fn category_root(&self, category: &str) -> &Path {
        match category {
            "scripts" => &self.scripts_root,
            "reports" => &self.reports_root,
            _ => &self.files_root,
        }
    }

    fn resolve_server_path(&self, category: &str, relative: &str) -> Result<PathBuf, TransferError> {
        let safe = safe_relative_path(relative).map_err(|_| TransferError::InvalidPath)?;
        util::join_contained(self.category_root(category), &safe).map_err(|_| TransferError::InvalidPath)
    }

    /// Mint a download token for `push-to-device`: the device will fetch the
    /// server-side `path` and write it to `target_path`. `shared_source_id`
    /// reference-counts the same server path across a multi-device fan-out.
    pub async fn mint_push(
        &self,
        device_udid: String,
        category: &str,
        path: &str,
        target_path: String,
        shared_source_id: Option<String>,
    ) -> Result<PushMinted, TransferError> {
        let server_path = self.resolve_server_path(category, path)?;
        let metadata = tokio::fs::metadata(&server_path).await.map_err(|_| TransferError::NotFound)?;
        let total_bytes = metadata.len();
        let md5 = md5_file(&server_path).await.map_err(|_| TransferError::Io)?;

        if let Some(shared_id) = &shared_source_id {
            let mut sources = self.shared_sources.write().await;
            sources
                .entry(shared_id.clone())
                .and_modify(|s| s.refcount += 1)
                .or_insert_with(|| SharedSource { path: server_path.clone(), refcount: 1 });
        }

        let token = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(TransferToken {
            kind: TokenKind::Push,
            device_udid,
            server_path,
            device_path: target_path,
            size: Some(total_bytes),
            sha256: None,
            expires_at: Instant::now() + TOKEN_TTL,
            consumed: AtomicBool::new(false),
            shared_source_id,
        });
        self.tokens.write().await.insert(token.clone(), entry);
        Ok(PushMinted { token, total_bytes, md5 })
    }

    /// Mint an upload token for `pull-from-device`: the device will PUT its
    /// `source_path` bytes to this token's upload URL, to be stored at
    /// `path` under the server's file store.
    pub async fn mint_pull(
        &self,
        device_udid: String,
        source_path: String,
        category: &str,
        path: &str,
    ) -> Result<String, TransferError> {
        let server_path = self.resolve_server_path(category, path)?;
        let token = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(TransferToken {
            kind: TokenKind::Pull,
            device_udid,
            server_path,
            device_path: source_path,
            size: None,
            sha256: None,
            expires_at: Instant::now() + TOKEN_TTL,
            consumed: AtomicBool::new(false),
            shared_source_id: None,
        });
        self.tokens.write().await.insert(token.clone(), entry);
        Ok(token)
    }

    /// Claim `token` for a one-shot download, returning the file path to
    /// stream and its size. §8 invariant 5: only the first caller succeeds.
    pub async fn claim_download(&self, token: &str) -> Result<(PathBuf, u64), TransferError> {
        let entry = self.tokens.read().await.get(token).cloned().ok_or(TransferError::NotFound)?;
        if entry.kind != TokenKind::Push {
            return Err(TransferError::NotFound);
        }
        if entry.is_expired() {
            self.tokens.write().await.remove(token);
            return Err(TransferError::Expired);
        }
        if !entry.try_consume() {
            return Err(TransferError::AlreadyConsumed);
        }
        let size = entry.size.unwrap_or(0);
        let path = entry.server_path.clone();
        self.release_shared_source(&entry).await;
        self.tokens.write().await.remove(token);
        Ok((path, size))
    }

    /// Claim `token` for a one-shot upload, returning the destination path
    /// to stream bytes into.
    pub async fn claim_upload(&self, token: &str) -> Result<PathBuf, TransferError> {
        let entry = self.tokens.read().await.get(token).cloned().ok_or(TransferError::NotFound)?;
        if entry.kind != TokenKind::Pull {
            return Err(TransferError::NotFound);
        }
        if entry.is_expired() {
            self.tokens.write().await.remove(token);
            return Err(TransferError::Expired);
        }
        if !entry.try_consume() {
            return Err(TransferError::AlreadyConsumed);
        }
        let path = entry.server_path.clone();
        self.tokens.write().await.remove(token);
        Ok(path)
    }

    /// Write `bytes` to `path` via a temp file + atomic rename, matching the
    /// teacher's durability idiom for completed transfers.
    pub async fn store_upload(&self, path: &Path, mut reader: impl tokio::io::AsyncRead + Unpin) -> std::io::Result<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut total = 0u64;
        let mut buf = [0u8; 65536];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(total)
    }

    async fn release_shared_source(&self, entry: &TransferToken) {
        let Some(shared_id) = &entry.shared_source_id else { return };
        let mut sources = self.shared_sources.write().await;
        let mut remove = false;
        if let Some(source) = sources.get_mut(shared_id) {
            source.refcount = source.refcount.saturating_sub(1);
            if source.refcount == 0 {
                remove = true;
            }
        }
        if remove {
            if let Some(source) = sources.remove(shared_id) {
                let _ = tokio::fs::remove_file(&source.path).await;
            }
        }
    }

    /// Remove expired, never-consumed tokens. Run periodically.
    pub async fn sweep_expired(&self) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired());
        before - tokens.len()
    }

    #[must_use]
    pub fn active_transfer_count(&self) -> u32 {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// Streaming whole-file SHA-256, grounded on the teacher's `gawdxfer::hasher`.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn md5_file(path: &Path) -> std::io::Result<String> {
    use md5::{Digest as Md5Digest, Md5};
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_over(root: PathBuf) -> TransferManager {
        TransferManager::new(root.clone(), root.clone(), root)
    }

    async fn manager_with_file(contents: &[u8]) -> (tempfile::TempDir, TransferManager, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, contents).await.unwrap();
        let manager = manager_over(dir.path().to_path_buf());
        (dir, manager, "payload.bin".to_string())
    }

    #[tokio::test]
    async fn push_token_consumes_exactly_once() {
        let (_dir, manager, rel) = manager_with_file(b"hello world").await;
        let minted = manager.mint_push("udid-a".to_string(), "files", &rel, "/dst".to_string(), None).await.unwrap();
        assert_eq!(minted.total_bytes, 11);

        let first = manager.claim_download(&minted.token).await;
        assert!(first.is_ok());
        let second = manager.claim_download(&minted.token).await;
        assert_eq!(second.unwrap_err(), TransferError::NotFound);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let (_dir, manager, _rel) = manager_with_file(b"x").await;
        let result = manager.mint_push("udid-a".to_string(), "files", "../../etc/passwd", "/dst".to_string(), None).await;
        assert_eq!(result.unwrap_err(), TransferError::InvalidPath);
    }

    #[tokio::test]
    async fn shared_source_refcount_deletes_temp_on_zero() {
        let dir = tempfile::tempdir().unwrap();
        let shared_path = dir.path().join("shared.bin");
        tokio::fs::write(&shared_path, b"shared payload").await.unwrap();
        let manager = manager_over(dir.path().to_path_buf());

        let a = manager
            .mint_push("udid-a".to_string(), "files", "shared.bin", "/dst".to_string(), Some("src1".to_string()))
            .await
            .unwrap();
        let b = manager
            .mint_push("udid-b".to_string(), "files", "shared.bin", "/dst".to_string(), Some("src1".to_string()))
            .await
            .unwrap();

        manager.claim_download(&a.token).await.unwrap();
        assert!(tokio::fs::try_exists(&shared_path).await.unwrap());
        manager.claim_download(&b.token).await.unwrap();
        assert!(!tokio::fs::try_exists(&shared_path).await.unwrap());
    }

    #[tokio::test]
    async fn upload_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_over(dir.path().to_path_buf());
        let token =
            manager.mint_pull("udid-a".to_string(), "/device/src".to_string(), "files", "uploaded.bin").await.unwrap();
        let dest = manager.claim_upload(&token).await.unwrap();
        let payload = b"round trip payload".to_vec();
        manager.store_upload(&dest, std::io::Cursor::new(payload.clone())).await.unwrap();
        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written, payload);
    }
}
