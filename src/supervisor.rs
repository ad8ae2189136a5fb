//! Built-in supervisor that restarts the server on crash (ADDED ambient
//! stack — §9). `xxtc-hub supervise` forks `xxtc-hub serve` and monitors it:
//! abnormal exit restarts with exponential backoff, a clean exit (code 0)
//! stops the supervisor, and SIGINT/SIGTERM are forwarded to the child.
//! Directly adapted from the teacher's `supervisor::run_supervisor`.

use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Run the supervisor loop. Does not return unless the child exits cleanly.
pub async fn run_supervisor(config_path: Option<&str>, sup_config: &SupervisorConfig) -> ! {
    let mut backoff = 1u64;
    let max_backoff = sup_config.max_backoff;
    let stable_threshold = Duration::from_secs(sup_config.stable_threshold);

    let exe = std::env::current_exe().expect("resolve own executable path");

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }

        let mut child = cmd.spawn().expect("failed to spawn server process");
        let server_pid = child.id();
        info!("supervisor: started server (pid {server_pid:?})");

        let fwd_pid = server_pid;
        let _signal_task = tokio::spawn(async move {
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("register SIGINT");
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("register SIGTERM");
            tokio::select! {
                _ = sigint.recv() => {
                    info!("supervisor: forwarding SIGINT to child");
                    if let Some(pid) = fwd_pid {
                        #[allow(clippy::cast_possible_wrap)]
                        unsafe { libc::kill(pid as i32, libc::SIGINT); }
                    }
                }
                _ = sigterm.recv() => {
                    info!("supervisor: forwarding SIGTERM to child");
                    if let Some(pid) = fwd_pid {
                        #[allow(clippy::cast_possible_wrap)]
                        unsafe { libc::kill(pid as i32, libc::SIGTERM); }
                    }
                }
            }
        });

        let status = child.wait().await;
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("server exited cleanly, supervisor stopping");
                std::process::exit(0);
            }
            Ok(s) => {
                warn!("server exited: {s} (uptime {:.1}s), restarting in {backoff}s", uptime.as_secs_f64());
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = next_backoff(backoff, uptime, stable_threshold, max_backoff);
            }
            Err(e) => {
                error!("server wait error: {e} (uptime {:.1}s), restarting in {backoff}s", uptime.as_secs_f64());
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = next_backoff(backoff, uptime, stable_threshold, max_backoff);
            }
        }
    }
}

fn next_backoff(current: u64, uptime: Duration, stable_threshold: Duration, max_backoff: u64) -> u64 {
    if uptime >= stable_threshold {
        1
    } else {
        (current * 2).min(max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_resets_after_stable_uptime() {
        let reset = next_backoff(16, Duration::from_secs(31), Duration::from_secs(30), 60);
        assert_eq!(reset, 1);
    }

    #[test]
    fn backoff_doubles_and_caps_below_threshold() {
        assert_eq!(next_backoff(16, Duration::from_secs(1), Duration::from_secs(30), 60), 32);
        assert_eq!(next_backoff(40, Duration::from_secs(1), Duration::from_secs(30), 60), 60);
    }
}
