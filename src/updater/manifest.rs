//! Manifest fetch (§4.9 `check`): a JSON document at an explicit URL or the
//! repo's "latest" convention, selecting an asset by `{os, arch}`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::version::UpdateVersion;

/// Total timeout for the manifest fetch (§5 "Update check: 60 s total").
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestAsset {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub version: UpdateVersion,
    /// Keyed by `"{os}-{arch}"`, e.g. `"linux-x86_64"`.
    pub assets: HashMap<String, ManifestAsset>,
}

impl Manifest {
    #[must_use]
    pub fn asset_for(&self, os: &str, arch: &str) -> Option<&ManifestAsset> {
        self.assets.get(&format!("{os}-{arch}"))
    }
}

#[derive(Debug)]
pub enum ManifestError {
    Unreachable(String),
    Malformed(String),
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::Unreachable(e) => write!(f, "manifest unreachable: {e}"),
            ManifestError::Malformed(e) => write!(f, "manifest malformed: {e}"),
        }
    }
}

impl std::error::Error for ManifestError {}

/// Fetch and parse the manifest from `url`, bounded by [`CHECK_TIMEOUT`].
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Manifest, ManifestError> {
    let response = tokio::time::timeout(CHECK_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| ManifestError::Unreachable("timed out".to_string()))?
        .map_err(|e| ManifestError::Unreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ManifestError::Unreachable(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| ManifestError::Unreachable(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ManifestError::Malformed(e.to_string()))
}

/// Resolve the effective manifest URL: an explicit `manifest_url` wins, else
/// the `"latest"` convention relative to a repo base.
#[must_use]
pub fn resolve_manifest_url(manifest_url: Option<&str>, channel: &str) -> String {
    match manifest_url {
        Some(url) => url.to_string(),
        None => format!("https://updates.xxtc.example/{channel}/latest.json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_explicit_url() {
        let url = resolve_manifest_url(Some("https://example.com/m.json"), "stable");
        assert_eq!(url, "https://example.com/m.json");
    }

    #[test]
    fn resolve_falls_back_to_latest_convention() {
        let url = resolve_manifest_url(None, "beta");
        assert!(url.contains("beta"));
        assert!(url.ends_with("latest.json"));
    }

    #[test]
    fn asset_for_looks_up_by_os_arch_key() {
        let manifest = Manifest {
            version: UpdateVersion::parse("1700000000-1.0.0"),
            assets: HashMap::from([(
                "linux-x86_64".to_string(),
                ManifestAsset { url: "https://x/a.tar.gz".to_string(), sha256: None, size: None },
            )]),
        };
        assert!(manifest.asset_for("linux", "x86_64").is_some());
        assert!(manifest.asset_for("darwin", "arm64").is_none());
    }
}
