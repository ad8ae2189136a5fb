//! Shared application state (`AppState`), threaded through every route
//! handler and websocket task via axum's `State` extractor. Grounded on the
//! teacher's own `AppState` in `main.rs`, which bundles the relay state,
//! config, and activity log behind `Arc`s for cheap handler-to-handler
//! sharing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::activity::ActivityLog;
use crate::config::{Config, TurnConfig};
use crate::groups::GroupStore;
use crate::http_proxy::PendingHttpStore;
use crate::registry::Registry;
use crate::transfer::TransferManager;
use crate::turn::{TurnStartupError, TurnState};
use crate::updater::UpdateManager;

/// Capacity of the in-process ring buffer backing `GET /api/activity` (§4.10).
const ACTIVITY_LOG_CAPACITY: usize = 2048;

/// Capacity of the activity-broadcast channel subscribed to by every
/// connected controller's forwarding task (see `ws.rs`).
const ACTIVITY_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum BootstrapError {
    Turn(TurnStartupError),
    Io(std::io::Error),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapError::Turn(e) => write!(f, "{e}"),
            BootstrapError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<std::io::Error> for BootstrapError {
    fn from(e: std::io::Error) -> Self {
        BootstrapError::Io(e)
    }
}

impl From<TurnStartupError> for BootstrapError {
    fn from(e: TurnStartupError) -> Self {
        BootstrapError::Turn(e)
    }
}

pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub activity: Arc<ActivityLog>,
    pub activity_broadcast: broadcast::Sender<Value>,
    pub pending_http: Arc<PendingHttpStore>,
    pub transfer: Arc<TransferManager>,
    pub groups: Arc<GroupStore>,
    pub turn: Arc<TurnState>,
    pub updater: Arc<UpdateManager>,
    pub started_at: Instant,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            activity: self.activity.clone(),
            activity_broadcast: self.activity_broadcast.clone(),
            pending_http: self.pending_http.clone(),
            transfer: self.transfer.clone(),
            groups: self.groups.clone(),
            turn: self.turn.clone(),
            updater: self.updater.clone(),
            started_at: self.started_at,
        }
    }
}

impl AppState {
    /// Build the full application state at process startup: loads the group
    /// store from disk, resolves TURN (fatal if enabled without a usable
    /// public address, §7 `TURNPublicIPInvalid`), and recovers updater state
    /// from its last persisted snapshot.
    pub async fn bootstrap(mut config: Config) -> Result<Self, BootstrapError> {
        let secret_path = config.default_save_path();
        config.ensure_turn_secret(&secret_path).await?;
        let config = Arc::new(config);
        let (activity_broadcast, _) = broadcast::channel(ACTIVITY_BROADCAST_CAPACITY);
        let activity = Arc::new(ActivityLog::new(ACTIVITY_LOG_CAPACITY, activity_broadcast.clone()));

        tokio::fs::create_dir_all(config.files_dir()).await?;
        tokio::fs::create_dir_all(config.scripts_dir()).await?;
        tokio::fs::create_dir_all(config.reports_dir()).await?;

        let groups = Arc::new(GroupStore::load(config.groups_path()).await?);
        let transfer =
            Arc::new(TransferManager::new(config.files_dir(), config.scripts_dir(), config.reports_dir()));
        let turn = Arc::new(TurnState::resolve(config.turn.clone()).await?);
        let updater = Arc::new(UpdateManager::load(&config, &current_version()).await?);

        Ok(Self {
            config,
            registry: Arc::new(Registry::new()),
            activity,
            activity_broadcast,
            pending_http: Arc::new(PendingHttpStore::new()),
            transfer,
            groups,
            turn,
            updater,
            started_at: Instant::now(),
        })
    }

    /// A fully in-memory `AppState` for unit tests — never touches disk, the
    /// network, or a TURN resolution, and is constructible from a plain
    /// `#[test]` with no tokio runtime.
    #[must_use]
    pub fn new_for_test() -> Self {
        let config = Config::default();
        let (activity_broadcast, _) = broadcast::channel(ACTIVITY_BROADCAST_CAPACITY);
        let activity = Arc::new(ActivityLog::new(64, activity_broadcast.clone()));
        Self {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            activity,
            activity_broadcast,
            pending_http: Arc::new(PendingHttpStore::new()),
            transfer: Arc::new(TransferManager::new(
                PathBuf::from("test-files"),
                PathBuf::from("test-scripts"),
                PathBuf::from("test-reports"),
            )),
            groups: Arc::new(GroupStore::new_empty(PathBuf::from("test-groups.json"))),
            turn: Arc::new(TurnState::disabled()),
            updater: Arc::new(UpdateManager::new_for_test(&current_version())),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn turn_config(&self) -> &TurnConfig {
        &self.config.turn
    }
}

/// This build's own version, in the same `<timestamp>-<semver>` shape the
/// updater compares manifests against. No build-time timestamp is wired in
/// (no build script), so locally built binaries always compare below any
/// real, timestamped manifest entry — which is the conservative direction to
/// err in for "is an update available".
#[must_use]
pub fn current_version() -> String {
    format!("0-{}", env!("CARGO_PKG_VERSION"))
}
