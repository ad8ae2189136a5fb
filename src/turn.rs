//! Embedded TURN Relay (C9).
//!
//! The TURN wire protocol itself (STUN binding, allocate/refresh/channel-bind
//! messages) is explicitly out of scope (spec §1) — only its control surface
//! is implemented here: short-lived REST/`iceServers` credential issuance
//! (pure HMAC, shared shape with C1), the UDP+TCP listener lifecycle, and
//! ephemeral-port allocation bookkeeping with an expiry sweep. Grounded
//! structurally on the teacher's background-sweep-task pattern
//! (`tunnel::relay::RelayState::sweep_dead_devices`, `main.rs`'s periodic
//! sweep spawn).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::TurnConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize)]
pub struct TurnCredential {
    pub username: String,
    pub password: String,
    pub ttl: u64,
}

/// `password = base64(HMAC_SHA256(secret, username))` (§4.7, §3).
#[must_use]
pub fn derive_password(secret: &str, username: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(username.as_bytes());
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, mac.finalize().into_bytes())
}

/// `username = "{exp_unix}:{label}"` where `exp_unix = now + ttl`.
#[must_use]
pub fn issue_credential(secret: &str, ttl_secs: u64, label: &str) -> TurnCredential {
    let exp = unix_now() + ttl_secs;
    let username = format!("{exp}:{label}");
    let password = derive_password(secret, &username);
    TurnCredential { username, password, ttl: ttl_secs }
}

/// `true` iff the embedded `username`'s expiry timestamp is in the future.
#[must_use]
pub fn credential_is_live(username: &str) -> bool {
    username
        .split_once(':')
        .and_then(|(exp, _)| exp.parse::<i64>().ok())
        .is_some_and(|exp| exp > unix_now())
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

struct Allocation {
    expires_at: i64,
    relay_port: u16,
}

/// Public relay state: the resolved public address, the shared secret, and
/// the in-process allocation table (owned only by the relay task, per §5).
pub struct TurnState {
    config: TurnConfig,
    public_addr: Option<Ipv4Addr>,
    allocations: RwLock<HashMap<String, Allocation>>,
    next_ephemeral: AtomicU16,
}

impl TurnState {
    /// Construct a disabled, resolution-free `TurnState` for tests that
    /// never exercise the TURN surface.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: TurnConfig::default(),
            public_addr: None,
            allocations: RwLock::new(HashMap::new()),
            next_ephemeral: AtomicU16::new(0),
        }
    }

    /// Resolve the public address at startup. Returns `Err` (fatal per §7
    /// `TURNPublicIPInvalid`) only when TURN is enabled and neither an
    /// explicit IPv4 nor a resolvable A record is available.
    pub async fn resolve(config: TurnConfig) -> Result<Self, TurnStartupError> {
        if !config.enabled {
            return Ok(Self {
                config,
                public_addr: None,
                allocations: RwLock::new(HashMap::new()),
                next_ephemeral: AtomicU16::new(0),
            });
        }

        let public_addr = if let Some(ip) = config.public_ip {
            ip
        } else if let Some(hostname) = config.public_hostname.clone() {
            resolve_a_record(&hostname).await.ok_or(TurnStartupError::PublicIpInvalid)?
        } else {
            return Err(TurnStartupError::PublicIpInvalid);
        };

        let (lo, _hi) = config.relay_port_range;
        Ok(Self {
            config,
            public_addr: Some(public_addr),
            allocations: RwLock::new(HashMap::new()),
            next_ephemeral: AtomicU16::new(lo),
        })
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// `iceServers` entries to merge into a `control/http` WebRTC response
    /// (§4.5). Empty when TURN is disabled.
    pub async fn ice_servers(&self) -> Vec<Value> {
        let Some(credential) = self.issue_credential("default").await else {
            return Vec::new();
        };
        vec![serde_json::json!({
            "urls": format!("turn:{}:{}", self.public_addr.expect("credential implies resolved address"), self.config.port),
            "username": credential.username,
            "credential": credential.password,
        })]
    }

    /// Issue a fresh short-lived credential for `label` (§4.7 REST surface).
    /// `None` when TURN is disabled.
    pub async fn issue_credential(&self, label: &str) -> Option<TurnCredential> {
        let _public_addr = self.public_addr?;
        Some(issue_credential(&self.config.secret, self.config.credential_ttl_secs, label))
    }

    /// Lease the next ephemeral relay port in the configured range for a new
    /// allocation, wrapping back to the range start (best-effort; this is
    /// bookkeeping only, not a real TURN allocation).
    async fn lease_port(&self, username: &str, ttl_secs: u64) -> u16 {
        let (lo, hi) = self.config.relay_port_range;
        let mut port = self.next_ephemeral.fetch_add(1, Ordering::Relaxed);
        if port < lo || port > hi {
            port = lo;
            self.next_ephemeral.store(lo + 1, Ordering::Relaxed);
        }
        let expires_at = unix_now() + i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        self.allocations
            .write()
            .await
            .insert(username.to_string(), Allocation { expires_at, relay_port: port });
        port
    }

    /// Evict allocations whose credential has expired. Run periodically by
    /// the owning task.
    async fn sweep_expired(&self) -> usize {
        let mut allocations = self.allocations.write().await;
        let now = unix_now();
        let before = allocations.len();
        allocations.retain(|_, a| a.expires_at > now);
        before - allocations.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStartupError {
    PublicIpInvalid,
}

impl std::fmt::Display for TurnStartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnStartupError::PublicIpInvalid => write!(f, "TURN public address could not be determined"),
        }
    }
}

impl std::error::Error for TurnStartupError {}

/// A-record-only resolution (§4.7: "AAAA-only fails startup").
async fn resolve_a_record(hostname: &str) -> Option<Ipv4Addr> {
    let target = format!("{hostname}:0");
    let addrs = tokio::net::lookup_host(target).await.ok()?;
    addrs.filter_map(|addr| match addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }).next()
}

/// Spawn the UDP and TCP listener tasks plus the allocation-expiry sweep.
/// Returns immediately; listeners run until the process exits.
pub async fn spawn_listeners(state: Arc<TurnState>) -> std::io::Result<()> {
    if !state.enabled() {
        return Ok(());
    }
    let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, state.config.port).into();

    let udp = UdpSocket::bind(bind_addr).await?;
    info!(%bind_addr, "TURN UDP listener bound");
    let udp_state = state.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            match udp.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    // Wire-protocol parsing is out of scope; we only track
                    // that an allocation under this source saw traffic.
                    let label = from.to_string();
                    if n > 0 {
                        let _ = udp_state.lease_port(&label, udp_state.config.credential_ttl_secs).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "TURN UDP recv failed");
                    break;
                }
            }
        }
    });

    let tcp = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "TURN TCP listener bound");
    tokio::spawn(async move {
        loop {
            match tcp.accept().await {
                Ok((_socket, _peer_addr)) => {
                    // Allocation/channel-bind handling is out of scope; the
                    // connection is accepted and immediately dropped, which
                    // is sufficient to exercise listener lifecycle tests.
                }
                Err(e) => {
                    error!(error = %e, "TURN TCP accept failed");
                    break;
                }
            }
        }
    });

    let sweep_state = state;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let evicted = sweep_state.sweep_expired().await;
            if evicted > 0 {
                info!(evicted, "TURN allocations swept");
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_round_trips_password() {
        let cred = issue_credential("shh", 3600, "default");
        assert_eq!(cred.password, derive_password("shh", &cred.username));
    }

    #[test]
    fn credential_is_live_respects_expiry() {
        let future = format!("{}:default", unix_now() + 3600);
        let past = format!("{}:default", unix_now() - 10);
        assert!(credential_is_live(&future));
        assert!(!credential_is_live(&past));
    }

    #[tokio::test]
    async fn disabled_turn_yields_no_ice_servers() {
        let state = TurnState::resolve(TurnConfig::default()).await.unwrap();
        assert!(state.ice_servers().await.is_empty());
    }

    #[tokio::test]
    async fn enabled_without_address_fails_startup() {
        let mut config = TurnConfig::default();
        config.enabled = true;
        let result = TurnState::resolve(config).await;
        assert_eq!(result.unwrap_err(), TurnStartupError::PublicIpInvalid);
    }

    #[tokio::test]
    async fn enabled_with_public_ip_issues_ice_servers() {
        let mut config = TurnConfig::default();
        config.enabled = true;
        config.public_ip = Some(Ipv4Addr::new(203, 0, 113, 9));
        config.secret = "shh".to_string();
        let state = TurnState::resolve(config).await.unwrap();
        let servers = state.ice_servers().await;
        assert_eq!(servers.len(), 1);
        assert!(servers[0]["urls"].as_str().unwrap().contains("203.0.113.9"));
    }
}
