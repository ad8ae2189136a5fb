//! Configuration & secret store (C2).
//!
//! The primary config file is JSON (§6), loaded with an environment-over-file
//! precedence chain modeled on the teacher's `Config::load`: an explicit path
//! (CLI flag) wins, then `XXTHUB_*` environment variables override individual
//! fields of whatever file was loaded (or the compiled defaults if no file
//! exists yet), then compiled defaults fill in anything left unset.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::util;

fn default_listen() -> String {
    "0.0.0.0:46952".to_string()
}
fn default_ping_interval() -> u64 {
    15
}
fn default_ping_timeout_multiplier() -> u64 {
    3
}
fn default_frontend_dir() -> String {
    "frontend".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_turn_port() -> u16 {
    43478
}
fn default_turn_port_range() -> (u16, u16) {
    (49152, 65535)
}
fn default_turn_credential_ttl() -> u64 {
    3600
}
fn default_update_channel() -> String {
    "stable".to_string()
}

/// 32 random bytes, hex-encoded, used as the TURN credential HMAC key.
fn generate_turn_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `host:port` the HTTP front end binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// `HMAC_SHA256("XXTouch", password)` — 64 lowercase hex chars, or empty
    /// if no password has been set yet (signature verification always fails
    /// against an empty passhash).
    #[serde(default)]
    pub passhash: String,

    /// Seconds between liveness pings sent to each peer (§4.3).
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Multiplier applied to `ping_interval` for idle-disconnect (§9: honored
    /// rather than left inert — see DESIGN.md open-question decision).
    #[serde(default = "default_ping_timeout_multiplier")]
    pub ping_timeout: u64,

    #[serde(default = "default_frontend_dir")]
    pub frontend_dir: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub public_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub public_hostname: Option<String>,
    #[serde(default = "default_turn_port")]
    pub port: u16,
    #[serde(default = "default_turn_port_range")]
    pub relay_port_range: (u16, u16),
    /// Shared secret used to derive TURN credential passwords. Generated at
    /// first boot if absent and persisted back to the config file.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_turn_credential_ttl")]
    pub credential_ttl_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            public_ip: None,
            public_hostname: None,
            port: default_turn_port(),
            relay_port_range: default_turn_port_range(),
            secret: String::new(),
            credential_ttl_secs: default_turn_credential_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_max_backoff() -> u64 {
    60
}
fn default_stable_threshold() -> u64 {
    30
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { max_backoff: default_max_backoff(), stable_threshold: default_stable_threshold() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default = "default_update_channel")]
    pub channel: String,
    /// Plumbing-only per spec §9 — persisted, no behavior attached.
    #[serde(default)]
    pub prompt_on_new_version: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            channel: default_update_channel(),
            prompt_on_new_version: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            passhash: String::new(),
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout_multiplier(),
            frontend_dir: default_frontend_dir(),
            data_dir: default_data_dir(),
            tls: None,
            turn: TurnConfig::default(),
            update: UpdateConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with precedence: explicit `path` (if given and it
    /// exists) > `xxtc.json` in the current directory (if it exists) >
    /// compiled defaults. Environment variables then override individual
    /// fields of whatever was loaded.
    pub async fn load(path: Option<&str>) -> std::io::Result<Self> {
        let candidate = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("xxtc.json"));

        let mut config = if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            let raw = tokio::fs::read_to_string(&candidate).await?;
            serde_json::from_str(&raw).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("XXTHUB_LISTEN") {
            self.listen = listen;
        }
        if let Ok(passhash) = std::env::var("XXTHUB_PASSHASH") {
            self.passhash = passhash;
        }
        if let Ok(data_dir) = std::env::var("XXTHUB_DATA_DIR") {
            self.data_dir = data_dir;
        }
        if let Ok(frontend_dir) = std::env::var("XXTHUB_FRONTEND_DIR") {
            self.frontend_dir = frontend_dir;
        }
    }

    /// Persist this config to `path` via write-to-temp + atomic rename.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let serialized = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        util::write_atomic(path, &serialized).await
    }

    /// Generate and persist a TURN shared secret if none has been set yet
    /// (`turn.secret`'s own doc comment: "generated at first boot if
    /// absent"). Call once, right after loading, before the config is
    /// wrapped for sharing.
    pub async fn ensure_turn_secret(&mut self, path: &Path) -> std::io::Result<()> {
        if !self.turn.secret.is_empty() {
            return Ok(());
        }
        self.turn.secret = generate_turn_secret();
        self.save(path).await
    }

    /// Default on-disk location this config is persisted to when no
    /// explicit path was supplied to `load`.
    #[must_use]
    pub fn default_save_path(&self) -> PathBuf {
        self.data_dir().join("xxtc.json")
    }

    /// Validate invariants that must hold before the server starts serving
    /// traffic. Returns a list of human-readable errors; an empty list means
    /// the config is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("invalid listen address: {}", self.listen));
        }
        if self.ping_interval == 0 {
            errors.push("ping_interval must be greater than zero".to_string());
        }
        if self.turn.enabled {
            if self.turn.public_ip.is_none() && self.turn.public_hostname.is_none() {
                errors.push(
                    "turn.enabled requires turn.public_ip or turn.public_hostname".to_string(),
                );
            }
            let (lo, hi) = self.turn.relay_port_range;
            if lo >= hi {
                errors.push("turn.relay_port_range must have lo < hi".to_string());
            }
        }
        errors
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir().join("files")
    }

    #[must_use]
    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir().join("scripts")
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir().join("reports")
    }

    #[must_use]
    pub fn groups_path(&self) -> PathBuf {
        self.data_dir().join("groups.json")
    }

    #[must_use]
    pub fn app_settings_path(&self) -> PathBuf {
        self.data_dir().join("app-settings.json")
    }

    #[must_use]
    pub fn updater_state_path(&self) -> PathBuf {
        self.data_dir().join("updater").join("state.json")
    }

    #[must_use]
    pub fn updater_cache_dir(&self) -> PathBuf {
        self.data_dir().join("updater").join("cache")
    }

    #[must_use]
    pub fn updater_staging_dir(&self) -> PathBuf {
        self.data_dir().join("updater").join("staging")
    }

    #[must_use]
    pub fn updater_worker_dir(&self) -> PathBuf {
        self.data_dir().join("updater").join("worker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = Config::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn turn_enabled_without_address_is_invalid() {
        let mut config = Config::default();
        config.turn.enabled = true;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("public_ip")));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xxtc.json");
        let mut config = Config::default();
        config.passhash = crate::signer::Signer::hash_password("secret");
        config.save(&path).await.unwrap();

        let loaded = Config::load(Some(path.to_str().unwrap())).await.unwrap();
        assert_eq!(loaded.passhash, config.passhash);
    }
}
