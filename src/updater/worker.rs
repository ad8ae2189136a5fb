//! `-update-worker <job>` helper entrypoint (§4.9 apply, native variant).
//!
//! Spawned detached by [`super::apply::apply_staged`] just before the parent
//! server process exits. Waits for the parent pid to actually disappear (so
//! the old binary's file is no longer mapped/executing), then performs the
//! swap as two atomic renames with a `.bak` fallback, starts the replacement
//! process, and exits. Any failure after the first rename rolls the `.bak`
//! back into place so the server never comes back up missing its binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{error, info, warn};

use super::apply::{backup_path_for, ApplyJob};

const PARENT_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PARENT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct WorkerError(String);

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for WorkerError {}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError(e.to_string())
    }
}

/// Run the worker to completion. Returns `Ok(())` once the new process has
/// been started; the caller (the worker binary's `main`) should exit
/// immediately afterward regardless of outcome.
pub async fn run(job_path: &Path) -> Result<(), WorkerError> {
    let raw = tokio::fs::read_to_string(job_path).await?;
    let job: ApplyJob =
        serde_json::from_str(&raw).map_err(|e| WorkerError(format!("malformed job file: {e}")))?;

    wait_for_parent_exit(job.parent_pid).await;

    let backup = backup_path_for(&job.current_exe);
    tokio::fs::rename(&job.current_exe, &backup).await?;

    if let Err(e) = tokio::fs::rename(&job.staged_exe, &job.current_exe).await {
        warn!(error = %e, "staged rename failed, rolling back");
        tokio::fs::rename(&backup, &job.current_exe).await?;
        let _ = tokio::fs::remove_file(job_path).await;
        return Err(WorkerError(format!("apply failed, rolled back: {e}")));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&job.current_exe).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&job.current_exe, perms).await?;
    }

    if let (Some(staged_frontend), Some(current_frontend)) =
        (&job.staged_frontend_dir, &job.current_frontend_dir)
    {
        if let Err(e) = swap_frontend_dir(staged_frontend, current_frontend).await {
            warn!(error = %e, "frontend swap failed, rolling back binary");
            let _ = tokio::fs::rename(&job.current_exe, &job.staged_exe).await;
            tokio::fs::rename(&backup, &job.current_exe).await?;
            let _ = tokio::fs::remove_file(job_path).await;
            return Err(WorkerError(format!("frontend swap failed, rolled back: {e}")));
        }
    }

    match tokio::process::Command::new(&job.current_exe)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_) => info!(path = %job.current_exe.display(), "replacement process started"),
        Err(e) => {
            error!(error = %e, "failed to start replacement process after swap");
            let _ = tokio::fs::remove_file(job_path).await;
            return Err(WorkerError(format!("swap succeeded but restart failed: {e}")));
        }
    }

    let _ = tokio::fs::remove_file(job_path).await;
    Ok(())
}

/// Same atomic-rename-with-`.bak` treatment as the binary swap above, for
/// the staged frontend asset directory.
async fn swap_frontend_dir(staged: &Path, current: &Path) -> Result<(), WorkerError> {
    if tokio::fs::try_exists(current).await.unwrap_or(false) {
        tokio::fs::rename(current, backup_path_for(current)).await?;
    }
    tokio::fs::rename(staged, current).await?;
    Ok(())
}

/// Poll until `pid` no longer exists, or give up after
/// [`PARENT_EXIT_TIMEOUT`] (the parent is assumed gone either way — proceeding
/// with a live parent would at worst momentarily lose its old file handle).
async fn wait_for_parent_exit(pid: u32) {
    let deadline = tokio::time::Instant::now() + PARENT_EXIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if !process_exists(pid) {
            return;
        }
        tokio::time::sleep(PARENT_EXIT_POLL_INTERVAL).await;
    }
    warn!(pid, "parent process did not exit within timeout, proceeding anyway");
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(backup_path_for(Path::new("/opt/xxtc-hub")), PathBuf::from("/opt/xxtc-hub.bak"));
    }

    #[tokio::test]
    async fn wait_for_parent_exit_returns_immediately_for_dead_pid() {
        // A pid this high is never assigned on a real system, so
        // process_exists should report false on the very first poll.
        let started = tokio::time::Instant::now();
        wait_for_parent_exit(i32::MAX as u32 - 1).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
