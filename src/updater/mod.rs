//! Self-Updater (C10).
//!
//! Drives the `idle -> checking -> update_available -> downloading ->
//! downloaded -> applying -> replaced` state graph (§3 "Update State Record",
//! §4.9), persisting each transition to `data_dir/updater/state.json` via the
//! same write-to-temp + atomic rename idiom as [`crate::config::Config`] and
//! [`crate::groups::GroupStore`]. Grounded on the teacher's own update/version
//! bookkeeping in `main.rs` (boot-time state recovery) and `supervisor.rs`
//! (spawning a replacement process and waiting on it).

pub mod apply;
pub mod archive;
pub mod manifest;
pub mod version;
pub mod worker;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::util;
use manifest::{Manifest, ManifestAsset};
use version::UpdateVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    Idle,
    Checking,
    UpdateAvailable,
    Downloading,
    Downloaded,
    Applying,
    Replaced,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStateRecord {
    pub stage: UpdateStage,
    pub current_version: UpdateVersion,
    #[serde(default)]
    pub available_version: Option<UpdateVersion>,
    /// Asset resolved for the host `{os, arch}` the last time a download ran.
    #[serde(default)]
    pub latest_asset: Option<ManifestAsset>,
    #[serde(default)]
    pub downloaded_version: Option<UpdateVersion>,
    /// Archive path in the cache directory the last download wrote to.
    #[serde(default)]
    pub downloaded_path: Option<PathBuf>,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Staged executable inside `staging_dir`, resolved once extraction
    /// completes.
    #[serde(default)]
    pub source_binary: Option<PathBuf>,
    /// Staged frontend asset directory inside `staging_dir`, if the build
    /// shipped one.
    #[serde(default)]
    pub source_frontend_dir: Option<PathBuf>,
    /// Version an `apply` last successfully handed off. `current_version`
    /// only catches up to this once the *new* process boots — the process
    /// performing the apply is still running the old code.
    #[serde(default)]
    pub applied_version: Option<UpdateVersion>,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default)]
    pub bytes_total: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl UpdateStateRecord {
    fn fresh(current_version: UpdateVersion) -> Self {
        Self {
            stage: UpdateStage::Idle,
            current_version,
            available_version: None,
            latest_asset: None,
            downloaded_version: None,
            downloaded_path: None,
            staging_dir: None,
            source_binary: None,
            source_frontend_dir: None,
            applied_version: None,
            bytes_done: 0,
            bytes_total: None,
            last_error: None,
        }
    }

    fn clear_download_fields(&mut self) {
        self.available_version = None;
        self.latest_asset = None;
        self.downloaded_version = None;
        self.downloaded_path = None;
        self.staging_dir = None;
        self.source_binary = None;
        self.source_frontend_dir = None;
        self.applied_version = None;
        self.bytes_done = 0;
        self.bytes_total = None;
    }

    /// Boot-time reconciliation (§4.9 "Recovery on boot"): a crash mid-apply
    /// whose handoff already completed (the new process's own
    /// `current_version` now matches what was applied) converges straight to
    /// `idle`; a missing staging directory clears the stale source-path
    /// fields so a fresh check starts clean.
    fn recover(mut self) -> Self {
        if self.stage == UpdateStage::Applying
            && self.applied_version.as_ref() == Some(&self.current_version)
        {
            self.stage = UpdateStage::Idle;
            self.clear_download_fields();
            return self;
        }
        if let Some(dir) = &self.staging_dir {
            if !dir.exists() {
                let stage = self.stage;
                self.clear_download_fields();
                if matches!(stage, UpdateStage::Downloaded | UpdateStage::Applying) {
                    self.stage = UpdateStage::Idle;
                }
            }
        }
        self
    }
}

#[derive(Debug)]
pub enum UpdateError {
    InvalidTransition { from: UpdateStage, action: &'static str },
    Manifest(manifest::ManifestError),
    Archive(String),
    Io(std::io::Error),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} while stage is {from:?}")
            }
            UpdateError::Manifest(e) => write!(f, "{e}"),
            UpdateError::Archive(e) => write!(f, "{e}"),
            UpdateError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<std::io::Error> for UpdateError {
    fn from(e: std::io::Error) -> Self {
        UpdateError::Io(e)
    }
}

/// Owns the persisted update state and coordinates manifest checks, staged
/// downloads, and the in-place apply handoff. One instance per process.
pub struct UpdateManager {
    state_path: PathBuf,
    cache_dir: PathBuf,
    staging_dir_root: PathBuf,
    worker_dir: PathBuf,
    frontend_dir: PathBuf,
    manifest_url: String,
    client: reqwest::Client,
    state: RwLock<UpdateStateRecord>,
    /// Cancellation handle for an in-flight `download`, installed for the
    /// duration of the download and cleared once it settles. Deliberately
    /// not part of `UpdateStateRecord` — a cancellation primitive has no
    /// serde representation and has no business surviving a restart.
    download_cancel: RwLock<Option<CancellationToken>>,
}

impl UpdateManager {
    /// Construct an in-memory-only manager for tests that never touch disk
    /// or the network.
    #[must_use]
    pub fn new_for_test(current_version: &str) -> Self {
        Self {
            state_path: PathBuf::from("test-updater-state.json"),
            cache_dir: PathBuf::from("test-updater-cache"),
            staging_dir_root: PathBuf::from("test-updater-staging"),
            worker_dir: PathBuf::from("test-updater-worker"),
            frontend_dir: PathBuf::from("test-frontend"),
            manifest_url: String::new(),
            client: reqwest::Client::new(),
            state: RwLock::new(UpdateStateRecord::fresh(UpdateVersion::parse(current_version))),
            download_cancel: RwLock::new(None),
        }
    }

    /// Load (or initialize) the persisted state and run boot-time recovery.
    pub async fn load(config: &Config, current_version: &str) -> std::io::Result<Self> {
        let state_path = config.updater_state_path();
        let current = UpdateVersion::parse(current_version);

        let loaded = if tokio::fs::try_exists(&state_path).await.unwrap_or(false) {
            let raw = tokio::fs::read_to_string(&state_path).await?;
            serde_json::from_str::<UpdateStateRecord>(&raw)
                .unwrap_or_else(|_| UpdateStateRecord::fresh(current.clone()))
        } else {
            UpdateStateRecord::fresh(current)
        };
        let recovered = loaded.recover();

        let manager = Self {
            state_path,
            cache_dir: config.updater_cache_dir(),
            staging_dir_root: config.updater_staging_dir(),
            worker_dir: config.updater_worker_dir(),
            frontend_dir: PathBuf::from(&config.frontend_dir),
            manifest_url: manifest::resolve_manifest_url(
                config.update.manifest_url.as_deref(),
                &config.update.channel,
            ),
            client: reqwest::Client::new(),
            state: RwLock::new(recovered.clone()),
            download_cancel: RwLock::new(None),
        };
        manager.persist(&recovered).await?;
        Ok(manager)
    }

    async fn persist(&self, record: &UpdateStateRecord) -> std::io::Result<()> {
        let serialized = serde_json::to_vec_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        util::write_atomic(&self.state_path, &serialized).await
    }

    pub async fn snapshot(&self) -> UpdateStateRecord {
        self.state.read().await.clone()
    }

    /// `idle -> checking -> {update_available, idle}` (§4.9 `check`).
    pub async fn check(&self) -> Result<UpdateStateRecord, UpdateError> {
        {
            let mut state = self.state.write().await;
            state.stage = UpdateStage::Checking;
            self.persist(&state).await?;
        }

        let result = manifest::fetch(&self.client, &self.manifest_url).await;
        let mut state = self.state.write().await;
        match result {
            Ok(manifest) => {
                if manifest.version > state.current_version {
                    state.stage = UpdateStage::UpdateAvailable;
                    state.available_version = Some(manifest.version.clone());
                    info!(version = %manifest.version, "update available");
                } else {
                    state.stage = UpdateStage::Idle;
                    state.available_version = None;
                }
                state.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "update check failed");
                state.stage = UpdateStage::Idle;
                state.last_error = Some(e.to_string());
            }
        }
        self.persist(&state).await?;
        Ok(state.clone())
    }

    /// `update_available -> downloading -> {downloaded, failed}` (§4.9
    /// `download`). Fetches the manifest again to resolve the asset for the
    /// host `{os, arch}`, streams it into the cache directory (reporting
    /// `bytes_done`/`bytes_total` as it goes), verifies its checksum if the
    /// manifest supplied one, and extracts it into a fresh staging
    /// directory. Racing `cancel_download` wins over a download that is
    /// still in flight.
    pub async fn download(&self, os: &str, arch: &str) -> Result<UpdateStateRecord, UpdateError> {
        {
            let state = self.state.read().await;
            if state.stage != UpdateStage::UpdateAvailable {
                return Err(UpdateError::InvalidTransition { from: state.stage, action: "download" });
            }
        }

        let token = CancellationToken::new();
        {
            let mut state = self.state.write().await;
            state.stage = UpdateStage::Downloading;
            state.bytes_done = 0;
            state.bytes_total = None;
            self.persist(&state).await?;
        }
        *self.download_cancel.write().await = Some(token.clone());

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.run_download(os, arch, &token) => Some(result),
        };
        self.download_cancel.write().await.take();

        let Some(outcome) = outcome else {
            // cancel_download() already drove stage/last_error to their
            // terminal values; don't clobber them with a stale outcome.
            return Ok(self.state.read().await.clone());
        };

        let mut state = self.state.write().await;
        match outcome {
            Ok(download) => {
                state.stage = UpdateStage::Downloaded;
                state.downloaded_version = Some(download.version);
                state.latest_asset = Some(download.asset);
                state.downloaded_path = Some(download.downloaded_path);
                state.staging_dir = Some(download.staging_dir);
                state.source_binary = Some(download.source_binary);
                state.source_frontend_dir = download.source_frontend_dir;
                state.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "update download failed");
                state.stage = UpdateStage::Failed;
                state.last_error = Some(e.to_string());
            }
        }
        self.persist(&state).await?;
        Ok(state.clone())
    }

    async fn run_download(
        &self,
        os: &str,
        arch: &str,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, UpdateError> {
        let manifest: Manifest =
            manifest::fetch(&self.client, &self.manifest_url).await.map_err(UpdateError::Manifest)?;
        let asset = manifest
            .asset_for(os, arch)
            .ok_or_else(|| UpdateError::Archive(format!("no asset for {os}-{arch}")))?
            .clone();

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let archive_path = self.cache_dir.join(format!("{}-{os}-{arch}", manifest.version));
        download_to_file(&self.client, &asset.url, &archive_path, cancel, &self.state)
            .await
            .map_err(UpdateError::Io)?;

        if let Some(expected) = &asset.sha256 {
            let actual = crate::transfer::sha256_file(&archive_path).await?;
            if &actual != expected {
                return Err(UpdateError::Archive("checksum mismatch".to_string()));
            }
        }

        let staging_dir = self.staging_dir_root.join(manifest.version.to_string());
        if staging_dir.exists() {
            tokio::fs::remove_dir_all(&staging_dir).await?;
        }
        tokio::fs::create_dir_all(&staging_dir).await?;
        archive::extract(&archive_path, &staging_dir).await.map_err(|e| UpdateError::Archive(e.to_string()))?;

        let exe_name = std::env::current_exe().ok().and_then(|p| p.file_name().map(std::ffi::OsStr::to_os_string));
        let source_binary = exe_name.map_or_else(|| staging_dir.clone(), |name| staging_dir.join(name));

        let source_frontend_dir = self.frontend_dir.file_name().map(|name| staging_dir.join(name)).filter(|p| p.exists());

        Ok(DownloadOutcome {
            version: manifest.version,
            asset,
            downloaded_path: archive_path,
            staging_dir,
            source_binary,
            source_frontend_dir,
        })
    }

    /// `downloading -> failed` (§4.9 cancel): interrupts the in-flight
    /// download via its cancellation token rather than letting it race to
    /// completion and overwrite this outcome.
    pub async fn cancel_download(&self) -> Result<UpdateStateRecord, UpdateError> {
        let mut state = self.state.write().await;
        if state.stage != UpdateStage::Downloading {
            return Err(UpdateError::InvalidTransition { from: state.stage, action: "cancel" });
        }
        if let Some(token) = self.download_cancel.read().await.as_ref() {
            token.cancel();
        }
        state.stage = UpdateStage::Failed;
        state.last_error = Some("download canceled".to_string());
        self.persist(&state).await?;
        Ok(state.clone())
    }

    /// `downloaded -> applying -> {replaced, failed}` (§4.9 `apply`). The
    /// actual process replacement is delegated to [`apply::apply_staged`],
    /// which picks the native-helper or in-process variant and validates the
    /// staged binary's reported version before touching anything.
    pub async fn apply(&self, current_exe: &std::path::Path) -> Result<UpdateStateRecord, UpdateError> {
        let (staging_dir, expected_version, current_version) = {
            let mut state = self.state.write().await;
            if state.stage != UpdateStage::Downloaded {
                return Err(UpdateError::InvalidTransition { from: state.stage, action: "apply" });
            }
            let Some(dir) = state.staging_dir.clone() else {
                return Err(UpdateError::Archive("no staged build to apply".to_string()));
            };
            let Some(expected) = state.downloaded_version.clone() else {
                return Err(UpdateError::Archive("no downloaded version recorded".to_string()));
            };
            let current = state.current_version.clone();
            state.stage = UpdateStage::Applying;
            self.persist(&state).await?;
            (dir, expected, current)
        };

        let outcome = apply::apply_staged(
            &staging_dir,
            current_exe,
            &self.frontend_dir,
            &self.worker_dir,
            &expected_version,
            &current_version,
        )
        .await;

        let mut state = self.state.write().await;
        match outcome {
            Ok(()) => {
                state.stage = UpdateStage::Replaced;
                state.applied_version = Some(expected_version);
                state.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "update apply failed");
                state.stage = UpdateStage::Failed;
                state.last_error = Some(e.to_string());
            }
        }
        self.persist(&state).await?;
        Ok(state.clone())
    }
}

/// Everything learned while staging a release, handed back from
/// `run_download` to `download` for recording on [`UpdateStateRecord`].
struct DownloadOutcome {
    version: UpdateVersion,
    asset: ManifestAsset,
    downloaded_path: PathBuf,
    staging_dir: PathBuf,
    source_binary: PathBuf,
    source_frontend_dir: Option<PathBuf>,
}

/// Stream `url` into `dest`, reporting progress into `state.bytes_done`
/// (and `bytes_total`, once the response headers are in) as chunks arrive,
/// and aborting early if `cancel` fires.
async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &std::path::Path,
    cancel: &CancellationToken,
    state: &RwLock<UpdateStateRecord>,
) -> std::io::Result<()> {
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let total = response.content_length();
    {
        let mut s = state.write().await;
        s.bytes_total = total;
        s.bytes_done = 0;
    }

    let mut stream = response.bytes_stream();
    let tmp = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut done: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;
        state.write().await.bytes_done = done;
    }
    file.flush().await?;
    drop(file);

    if cancel.is_cancelled() {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "download canceled"));
    }

    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: UpdateStage) -> UpdateStateRecord {
        let mut r = UpdateStateRecord::fresh(UpdateVersion::parse("1700000000-1.0.0"));
        r.stage = stage;
        r
    }

    #[test]
    fn recover_converges_applying_to_idle_when_version_already_current() {
        let mut r = record(UpdateStage::Applying);
        r.applied_version = Some(r.current_version.clone());
        let recovered = r.recover();
        assert_eq!(recovered.stage, UpdateStage::Idle);
        assert!(recovered.applied_version.is_none());
    }

    #[test]
    fn recover_clears_fields_when_staging_dir_missing() {
        let mut r = record(UpdateStage::Downloaded);
        r.downloaded_version = Some(UpdateVersion::parse("1700000001-1.1.0"));
        r.staging_dir = Some(PathBuf::from("/nonexistent/staging/path/for/tests"));
        let recovered = r.recover();
        assert_eq!(recovered.stage, UpdateStage::Idle);
        assert!(recovered.staging_dir.is_none());
        assert!(recovered.downloaded_version.is_none());
    }

    #[test]
    fn recover_leaves_idle_untouched() {
        let r = record(UpdateStage::Idle);
        let recovered = r.clone().recover();
        assert_eq!(recovered.stage, UpdateStage::Idle);
    }

    /// `cancel_download` persists state, unlike `new_for_test`'s other
    /// in-memory-only uses, so give it a real (temp-dir) `state_path` rather
    /// than the bare relative path `new_for_test` otherwise never writes to.
    fn manager_with_tempdir(dir: &tempfile::TempDir, current_version: &str) -> UpdateManager {
        let mut manager = UpdateManager::new_for_test(current_version);
        manager.state_path = dir.path().join("state.json");
        manager
    }

    #[tokio::test]
    async fn cancel_download_fails_with_exact_message() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_tempdir(&dir, "1700000000-1.0.0");
        {
            let mut state = manager.state.write().await;
            state.stage = UpdateStage::Downloading;
        }
        let record = manager.cancel_download().await.unwrap();
        assert_eq!(record.stage, UpdateStage::Failed);
        assert_eq!(record.last_error.as_deref(), Some("download canceled"));
    }

    #[tokio::test]
    async fn cancel_download_rejects_wrong_stage() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_tempdir(&dir, "1700000000-1.0.0");
        assert!(matches!(manager.cancel_download().await, Err(UpdateError::InvalidTransition { .. })));
    }
}
